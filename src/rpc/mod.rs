//! # Remote Call Contracts
//!
//! Abstract clients for a cluster's frontend (coordinator) and backends
//! (storage nodes). Transport and wire encoding live behind these traits;
//! the replication engine only sees the request and response shapes in
//! [`types`].
//!
//! Implementations return `Ok` with a non-OK [`Status`] when the remote side
//! answered with an error, and `Err` only when the call itself failed.

use async_trait::async_trait;

use crate::cluster::ClusterSpec;
use crate::error::Result;

pub mod concurrency;
pub mod types;

pub use concurrency::{ConcurrencyManager, ConcurrencyWindow};
pub use types::{
    Backend, BackendsResponse, BeginTxnResponse, Binlog, BinlogType, DbMetaInfo,
    GetBinlogResponse, IndexMetaInfo, IngestBinlogRequest, PartitionMetaInfo, ReplicaMetaInfo,
    RestoreSnapshotRequest, SnapshotResult, Status, StatusCode, SubTxnInfo, TableMetaInfo,
    TableMetaResponse, TableRef, TabletCommitInfo, TabletMetaInfo,
};

/// Client of a cluster frontend.
#[async_trait]
pub trait FeRpc: Send + Sync {
    /// Fetch changelog entries strictly after `commit_seq`.
    async fn get_binlog(&self, spec: &ClusterSpec, commit_seq: i64) -> Result<GetBinlogResponse>;

    async fn begin_transaction(
        &self,
        spec: &ClusterSpec,
        label: &str,
        table_ids: &[i64],
    ) -> Result<BeginTxnResponse>;

    /// Begin a transaction that carries `sub_txn_count` sub transactions.
    async fn begin_transaction_for_txn_insert(
        &self,
        spec: &ClusterSpec,
        label: &str,
        table_ids: &[i64],
        sub_txn_count: i64,
    ) -> Result<BeginTxnResponse>;

    async fn commit_transaction(
        &self,
        spec: &ClusterSpec,
        txn_id: i64,
        commit_infos: &[TabletCommitInfo],
    ) -> Result<Status>;

    async fn commit_transaction_for_txn_insert(
        &self,
        spec: &ClusterSpec,
        txn_id: i64,
        sub_txn_infos: &[SubTxnInfo],
    ) -> Result<Status>;

    async fn rollback_transaction(&self, spec: &ClusterSpec, txn_id: i64) -> Result<Status>;

    async fn get_snapshot(
        &self,
        spec: &ClusterSpec,
        snapshot_name: &str,
        compress: bool,
    ) -> Result<SnapshotResult>;

    async fn restore_snapshot(
        &self,
        spec: &ClusterSpec,
        request: &RestoreSnapshotRequest,
    ) -> Result<Status>;

    async fn get_backends(&self, spec: &ClusterSpec) -> Result<BackendsResponse>;

    /// Bulk fetch of the catalog tree for the given table ids.
    async fn get_table_meta(
        &self,
        spec: &ClusterSpec,
        table_ids: &[i64],
    ) -> Result<TableMetaResponse>;
}

/// Client of one backend.
#[async_trait]
pub trait BeRpc: Send + Sync {
    async fn ingest_binlog(&self, request: &IngestBinlogRequest) -> Result<Status>;
}

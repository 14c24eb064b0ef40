//! # Cluster Collaborators
//!
//! A job talks to two clusters. Each one is described by a [`ClusterSpec`]
//! and reached through four collaborators built by a [`ClusterFactory`]:
//!
//! - [`FeRpc`] / [`BeRpc`] for remote calls,
//! - [`ClusterOps`] for DDL-like statements and backup/restore bookkeeping,
//! - [`MetaCache`] for cached catalog lookups that survive across ticks.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::{
    AddPartition, AlterView, CreateTable, DropPartition, IndexChangeJob, ModifyComment,
    ModifyTableAddOrDropColumns, ModifyTableAddOrDropInvertedIndices, ModifyTableProperty,
    RenameColumn, RenameTable, TableType, TruncateTable,
};
use crate::rpc::{Backend, BeRpc, FeRpc};

/// Connection and scope descriptor of one side of a job.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub host: String,
    pub port: String,
    pub thrift_port: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub cluster: String,
    pub database: String,
    #[serde(default)]
    pub db_id: i64,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub table_id: i64,
    /// Private backend host to publicly reachable host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_mapping: Option<HashMap<String, String>>,
}

impl ClusterSpec {
    pub fn is_table_scope(&self) -> bool {
        !self.table.is_empty()
    }
}

impl fmt::Debug for ClusterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSpec")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("thrift_port", &self.thrift_port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("cluster", &self.cluster)
            .field("database", &self.database)
            .field("db_id", &self.db_id)
            .field("table", &self.table)
            .field("table_id", &self.table_id)
            .field("host_mapping", &self.host_mapping)
            .finish()
    }
}

impl fmt::Display for ClusterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.database)?;
        if !self.table.is_empty() {
            write!(f, ".{}", self.table)?;
        }
        Ok(())
    }
}

/// Outcome of requesting a partial backup on the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    Created,
    /// One of the requested partitions no longer exists upstream.
    PartitionNotFound,
    /// The table no longer exists upstream under the requested name.
    TableNotFound,
}

/// State of a restore job on the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreProgress {
    Running,
    Finished,
    /// The restore was cancelled because an existing table or view has a
    /// different signature than the one in the snapshot.
    SignatureNotMatched,
}

/// Statement-level operations against one cluster.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    async fn valid(&self) -> Result<()>;
    async fn is_database_enable_binlog(&self) -> Result<bool>;
    async fn is_enable_restore_snapshot_compression(&self) -> Result<bool>;
    async fn get_all_tables(&self) -> Result<Vec<String>>;
    async fn get_all_views_from_table(&self, table: &str) -> Result<Vec<String>>;

    async fn create_database(&self) -> Result<()>;
    async fn create_table_or_view(&self, create: &CreateTable, src_database: &str) -> Result<()>;
    async fn check_database_exists(&self) -> Result<bool>;
    /// Whether the table this cluster handle points at exists.
    async fn check_table_exists(&self) -> Result<bool>;
    async fn check_table_exists_by_name(&self, table: &str) -> Result<bool>;
    /// Unsupported properties of the table this cluster handle points at.
    async fn check_table_property_valid(&self) -> Result<Vec<String>>;

    /// Name of a running or finished backup whose label starts with `prefix`.
    async fn get_valid_backup_job(&self, prefix: &str) -> Result<Option<String>>;
    /// Name of a running or finished restore whose label starts with `prefix`.
    async fn get_valid_restore_job(&self, prefix: &str) -> Result<Option<String>>;
    async fn cancel_restore_if_exists(&self, name: &str) -> Result<()>;
    async fn create_snapshot(&self, name: &str, tables: &[String]) -> Result<()>;
    async fn create_partial_snapshot(
        &self,
        name: &str,
        table: &str,
        partitions: &[String],
    ) -> Result<BackupOutcome>;
    async fn check_backup_finished(&self, name: &str) -> Result<bool>;
    async fn check_restore_finished(&self, name: &str) -> Result<RestoreProgress>;
    /// The table or view whose signature blocked the restore, and whether it is a table.
    async fn get_restore_signature_not_matched_table_or_view(
        &self,
        name: &str,
    ) -> Result<Option<(String, bool)>>;

    /// Block until a transaction whose publish timed out becomes visible.
    async fn wait_transaction_done(&self, txn_id: i64);

    async fn lightning_schema_change(
        &self,
        src_database: &str,
        table_alias: &str,
        change: &ModifyTableAddOrDropColumns,
    ) -> Result<()>;
    async fn rename_column(&self, table: &str, rename: &RenameColumn) -> Result<()>;
    async fn rename_table(&self, table: &str, rename: &RenameTable) -> Result<()>;
    async fn rename_table_with_name(&self, old_name: &str, new_name: &str) -> Result<()>;
    async fn modify_comment(&self, table: &str, comment: &ModifyComment) -> Result<()>;
    async fn modify_table_property(
        &self,
        table: &str,
        property: &ModifyTableProperty,
    ) -> Result<()>;
    async fn truncate_table(&self, table: &str, truncate: &TruncateTable) -> Result<()>;
    async fn replace_table(&self, from: &str, to: &str, swap: bool) -> Result<()>;
    async fn drop_table(&self, table: &str, force: bool) -> Result<()>;
    async fn drop_view(&self, view: &str) -> Result<()>;
    async fn alter_view_def(
        &self,
        src_database: &str,
        view: &str,
        alter: &AlterView,
    ) -> Result<()>;
    async fn add_partition(&self, table: &str, partition: &AddPartition) -> Result<()>;
    async fn drop_partition(&self, table: &str, partition: &DropPartition) -> Result<()>;
    async fn rename_partition(&self, table: &str, old_name: &str, new_name: &str) -> Result<()>;
    async fn lightning_index_change(
        &self,
        table: &str,
        change: &ModifyTableAddOrDropInvertedIndices,
    ) -> Result<()>;
    async fn build_index(&self, table: &str, job: &IndexChangeJob) -> Result<()>;
    async fn rename_rollup(&self, table: &str, old_name: &str, new_name: &str) -> Result<()>;
    async fn drop_rollup(&self, table: &str, rollup: &str) -> Result<()>;
    /// Detach tables from replication so they become writable.
    async fn desync_tables(&self, tables: &[String]) -> Result<()>;
}

/// Cached catalog entry for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub id: i64,
    pub name: String,
    pub table_type: TableType,
}

/// Cached catalog lookups against one cluster.
#[async_trait]
pub trait MetaCache: Send + Sync {
    async fn get_db_id(&self) -> Result<i64>;
    /// Meta error when no table has that name.
    async fn get_table_id(&self, name: &str) -> Result<i64>;
    /// Empty string when the id is unknown.
    async fn get_table_name_by_id(&self, id: i64) -> Result<String>;
    async fn get_table(&self, id: i64) -> Result<TableInfo>;
    /// Refresh and list every table of the database.
    async fn get_tables(&self) -> Result<BTreeMap<i64, TableInfo>>;
    /// List cached tables without refreshing.
    fn dirty_get_tables(&self) -> BTreeMap<i64, TableInfo>;
    /// Refresh one table by name.
    async fn update_table(&self, name: &str, id: i64) -> Result<TableInfo>;
    fn clear_tables_cache(&self);
    fn clear_table(&self, database: &str, table: &str);
    async fn get_backends(&self) -> Result<Vec<Backend>>;
    async fn get_master_token(&self) -> Result<String>;
    /// Fails unless both frontends and backends have binlog enabled.
    async fn check_binlog_feature(&self) -> Result<()>;
}

/// Builds the collaborators of a cluster.
pub trait ClusterFactory: Send + Sync {
    fn fe_rpc(&self, spec: &ClusterSpec) -> Result<Arc<dyn FeRpc>>;
    fn be_rpc(&self, backend: &Backend) -> Result<Arc<dyn BeRpc>>;
    fn cluster_ops(&self, spec: &ClusterSpec) -> Arc<dyn ClusterOps>;
    fn meta_cache(&self, spec: &ClusterSpec) -> Arc<dyn MetaCache>;
}

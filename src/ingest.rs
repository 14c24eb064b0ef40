//! # Tablet Ingestion
//!
//! Copies the data versions named by upsert table records from source
//! tablets into destination tablets, inside one destination transaction.
//!
//! The work runs in two phases:
//!
//! 1. **Plan**: build metadata snapshots of both clusters, match tables,
//!    partitions (by range), indexes (by name) and tablets (by position),
//!    and pick a source replica for every destination replica. Any failure
//!    here aborts the batch before a single RPC is issued.
//! 2. **Fan-out**: one task per destination replica, gated by the
//!    destination backend's [`ConcurrencyWindow`](crate::rpc::ConcurrencyWindow).
//!    Every task is awaited; the first recorded error wins and siblings are
//!    never cancelled.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument, trace, warn};

use crate::cluster::{ClusterFactory, ClusterSpec};
use crate::error::{Result, SyncError};
use crate::meta::{IndexMeta, MetaSnapshot, ReplicaMeta, TabletMeta};
use crate::record::{PartitionRecord, TableRecord};
use crate::rpc::{Backend, BeRpc, ConcurrencyManager, IngestBinlogRequest, TabletCommitInfo};
use crate::telemetry;

/// Job-level facts the planner needs.
#[derive(Debug, Clone, Copy)]
pub struct IngestScope<'a> {
    pub src: &'a ClusterSpec,
    pub dest: &'a ClusterSpec,
    pub table_sync: bool,
    /// Source table id to destination table id (database scope).
    pub table_mapping: &'a HashMap<i64, i64>,
    /// Shadow indexes to skip; `None` disables the filter.
    pub shadow_indexes: Option<&'a HashMap<i64, i64>>,
}

/// Acknowledgements of a finished batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub commit_infos: Vec<TabletCommitInfo>,
    /// Acknowledgements grouped by destination sub-transaction id.
    pub sub_txn_commit_infos: HashMap<i64, Vec<TabletCommitInfo>>,
}

/// One ingest RPC for one destination replica.
struct ReplicaIngest {
    be: Arc<dyn BeRpc>,
    dest_backend_id: i64,
    request: IngestBinlogRequest,
    commit_info: TabletCommitInfo,
    stid: i64,
}

/// Keeps the first error reported by any task.
#[derive(Default)]
struct ErrorSlot(Mutex<Option<SyncError>>);

impl ErrorSlot {
    fn set(&self, err: SyncError) {
        let mut slot = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take(&self) -> Option<SyncError> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Runs ingest batches for one job.
#[derive(Clone)]
pub struct TabletIngester {
    job_name: String,
    factory: Arc<dyn ClusterFactory>,
    concurrency: Arc<ConcurrencyManager>,
}

impl TabletIngester {
    pub fn new(
        job_name: impl Into<String>,
        factory: Arc<dyn ClusterFactory>,
        concurrency: Arc<ConcurrencyManager>,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            factory,
            concurrency,
        }
    }

    /// Ingest `records` into transaction `txn_id`.
    ///
    /// `stid_map` maps source sub-transaction ids to destination ones; a
    /// partition whose stid maps to a non-zero id ingests under that id.
    #[instrument(skip_all, fields(job = %self.job_name, txn_id = txn_id, tables = records.len()))]
    pub async fn ingest(
        &self,
        scope: IngestScope<'_>,
        txn_id: i64,
        records: &[TableRecord],
        stid_map: &HashMap<i64, i64>,
    ) -> Result<IngestOutcome> {
        let planner = self.prepare(scope, txn_id, records).await?;
        let mut tasks = Vec::new();
        for record in records {
            planner.prepare_table(record, stid_map, &mut tasks)?;
        }
        self.run(txn_id, tasks).await
    }

    async fn prepare<'a>(
        &self,
        scope: IngestScope<'a>,
        txn_id: i64,
        records: &[TableRecord],
    ) -> Result<Planner<'a>> {
        let (src_table_ids, dest_table_ids) = if scope.table_sync {
            (vec![scope.src.table_id], vec![scope.dest.table_id])
        } else {
            let src_ids: Vec<i64> = records.iter().map(|r| r.id).collect();
            let dest_ids = src_ids
                .iter()
                .map(|id| {
                    scope.table_mapping.get(id).copied().ok_or_else(|| {
                        SyncError::meta(format!(
                            "not found dest mapping table id, src table id: {id}"
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            (src_ids, dest_ids)
        };

        let src_fe = self.factory.fe_rpc(scope.src)?;
        let src_meta = MetaSnapshot::fetch(src_fe.as_ref(), scope.src, &src_table_ids).await?;
        let dest_fe = self.factory.fe_rpc(scope.dest)?;
        let dest_meta = MetaSnapshot::fetch(dest_fe.as_ref(), scope.dest, &dest_table_ids).await?;

        let src_backends = src_meta.get_backend_map()?;
        let dest_backends = dest_meta.get_backend_map()?;

        Ok(Planner {
            scope,
            txn_id,
            factory: self.factory.clone(),
            src_meta,
            dest_meta,
            src_backends,
            dest_backends,
        })
    }

    async fn run(&self, txn_id: i64, tasks: Vec<ReplicaIngest>) -> Result<IngestOutcome> {
        info!(txn_id, replicas = tasks.len(), "Run tablet ingest jobs");

        let errors = Arc::new(ErrorSlot::default());
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let window = self.concurrency.get_window(task.dest_backend_id);
            let errors = errors.clone();

            let handle = tokio::spawn(async move {
                let _permit = match window.acquire().await {
                    Ok(permit) => permit,
                    Err(err) => {
                        errors.set(err);
                        return None;
                    }
                };

                match task.be.ingest_binlog(&task.request).await {
                    Ok(status) if status.is_ok() => {
                        telemetry::record_ingest_rpc("ok");
                        Some((task.stid, task.commit_info))
                    }
                    Ok(status) => {
                        telemetry::record_ingest_rpc("error");
                        errors.set(SyncError::be(format!(
                            "ingest error, req {:?}, resp status: {status}",
                            task.request
                        )));
                        None
                    }
                    Err(err) => {
                        telemetry::record_ingest_rpc("failed");
                        errors.set(err);
                        None
                    }
                }
            });
            handles.push(handle);
        }

        let mut outcome = IngestOutcome::default();
        for handle in handles {
            match handle.await {
                Ok(Some((stid, commit_info))) => {
                    outcome.commit_infos.push(commit_info);
                    if stid != 0 {
                        outcome
                            .sub_txn_commit_infos
                            .entry(stid)
                            .or_default()
                            .push(commit_info);
                    }
                }
                Ok(None) => {}
                Err(err) => errors.set(SyncError::normal(format!("ingest task aborted: {err}"))),
            }
        }

        match errors.take() {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }
}

/// Matches source and destination catalogs for one batch.
struct Planner<'a> {
    scope: IngestScope<'a>,
    txn_id: i64,
    factory: Arc<dyn ClusterFactory>,
    src_meta: MetaSnapshot,
    dest_meta: MetaSnapshot,
    src_backends: BTreeMap<i64, Backend>,
    dest_backends: BTreeMap<i64, Backend>,
}

impl Planner<'_> {
    fn prepare_table(
        &self,
        record: &TableRecord,
        stid_map: &HashMap<i64, i64>,
        tasks: &mut Vec<ReplicaIngest>,
    ) -> Result<()> {
        trace!(txn_id = self.txn_id, table_id = record.id, "Prepare table");
        if self.src_meta.is_table_dropped(record.id) {
            info!(txn_id = self.txn_id, table_id = record.id, "Skip the dropped table");
            return Ok(());
        }
        if record.partition_records.is_empty() {
            return Err(SyncError::meta("partition records is empty"));
        }

        let (src_table_id, dest_table_id) = if self.scope.table_sync {
            (self.scope.src.table_id, self.scope.dest.table_id)
        } else {
            let dest = self.scope.table_mapping.get(&record.id).copied().ok_or_else(|| {
                SyncError::meta(format!(
                    "not found dest mapping table id, src table id: {}",
                    record.id
                ))
            })?;
            (record.id, dest)
        };

        let src_ranges = self.src_meta.get_partition_range_map(src_table_id)?;
        let dest_ranges = self.dest_meta.get_partition_range_map(dest_table_id)?;
        let live_partitions = || {
            record
                .partition_records
                .iter()
                .filter(|p| !p.is_temp && !self.src_meta.is_partition_dropped(p.id))
        };
        for partition in live_partitions() {
            if !src_ranges.contains_key(&partition.range) {
                return Err(SyncError::meta(format!(
                    "partition range: {} not in src cluster",
                    partition.range
                )));
            }
            if !dest_ranges.contains_key(&partition.range) {
                return Err(SyncError::meta(format!(
                    "partition range: {} not in dest cluster",
                    partition.range
                )));
            }
        }

        for partition in live_partitions() {
            self.prepare_partition(
                src_table_id,
                dest_table_id,
                partition,
                &record.index_ids,
                stid_map,
                tasks,
            )?;
        }
        Ok(())
    }

    fn is_filtered_index(&self, index_id: i64) -> bool {
        if self.src_meta.is_index_dropped(index_id) {
            return true;
        }
        self.scope
            .shadow_indexes
            .is_some_and(|shadow| shadow.contains_key(&index_id))
    }

    fn prepare_partition(
        &self,
        src_table_id: i64,
        dest_table_id: i64,
        partition: &PartitionRecord,
        index_ids: &[i64],
        stid_map: &HashMap<i64, i64>,
        tasks: &mut Vec<ReplicaIngest>,
    ) -> Result<()> {
        trace!(txn_id = self.txn_id, partition_id = partition.id, "Prepare partition");
        if index_ids.is_empty() {
            return Err(SyncError::meta("index ids is empty"));
        }

        let dest_partition_id = self
            .dest_meta
            .get_partition_id_by_range(dest_table_id, &partition.range)?;
        let src_indexes = self.src_meta.get_index_id_map(src_table_id, partition.id)?;
        let (dest_indexes, dest_base) =
            self.dest_meta.get_index_name_map(dest_table_id, dest_partition_id)?;

        let dest_index_name = |src_index: &IndexMeta| -> String {
            if self.scope.table_sync && src_index.name == self.scope.src.table {
                self.scope.dest.table.clone()
            } else if src_index.is_base_index {
                dest_base.name.clone()
            } else {
                src_index.name.clone()
            }
        };

        let mut pairs = Vec::new();
        for index_id in index_ids {
            if self.is_filtered_index(*index_id) {
                info!(txn_id = self.txn_id, index_id, "Skip the dropped or shadow index");
                continue;
            }
            let src_index = src_indexes.get(index_id).ok_or_else(|| {
                SyncError::meta(format!("index id {index_id} not found in src meta"))
            })?;
            let name = dest_index_name(src_index);
            let dest_index = dest_indexes.get(name.as_str()).ok_or_else(|| {
                SyncError::meta(format!(
                    "index name {name} not found in dest meta, is base index: {}, src index id: {index_id}",
                    src_index.is_base_index
                ))
            })?;
            pairs.push((src_index, *dest_index));
        }

        let stid = stid_map.get(&partition.stid).copied().unwrap_or(0);
        for (src_index, dest_index) in pairs {
            let src_tablets =
                self.src_meta
                    .get_tablets(src_table_id, partition.id, src_index.id)?;
            let dest_tablets =
                self.dest_meta
                    .get_tablets(dest_table_id, dest_partition_id, dest_index.id)?;
            if src_tablets.len() != dest_tablets.len() {
                return Err(SyncError::meta(format!(
                    "src tablets length: {} not equal to dest tablets length: {}",
                    src_tablets.len(),
                    dest_tablets.len()
                )));
            }
            if src_tablets.is_empty() {
                warn!(txn_id = self.txn_id, index = %src_index.name, "Source tablets length is 0, skip");
                continue;
            }

            for (src_tablet, dest_tablet) in src_tablets.values().zip(dest_tablets.values()) {
                self.prepare_tablet(
                    src_tablet,
                    dest_tablet,
                    partition.version,
                    stid,
                    dest_partition_id,
                    tasks,
                )?;
            }
        }
        Ok(())
    }

    fn prepare_tablet(
        &self,
        src_tablet: &TabletMeta,
        dest_tablet: &TabletMeta,
        binlog_version: i64,
        stid: i64,
        dest_partition_id: i64,
        tasks: &mut Vec<ReplicaIngest>,
    ) -> Result<()> {
        let src_replicas: Vec<&ReplicaMeta> = src_tablet
            .replicas
            .values()
            .filter(|replica| replica.version >= binlog_version)
            .collect();
        if src_replicas.is_empty() {
            return Err(SyncError::meta(format!(
                "no src replica version > {binlog_version}"
            )));
        }

        let txn_id = if stid != 0 { stid } else { self.txn_id };
        for (i, dest_replica) in dest_tablet.replicas.values().enumerate() {
            let src_replica = src_replicas[i % src_replicas.len()];
            let dest_backend = self.dest_backends.get(&dest_replica.backend_id).ok_or_else(|| {
                SyncError::meta(format!(
                    "backend not found, backend id: {}",
                    dest_replica.backend_id
                ))
            })?;
            let src_backend = self.src_backends.get(&src_replica.backend_id).ok_or_else(|| {
                SyncError::meta(format!(
                    "backend not found, backend id: {}",
                    src_replica.backend_id
                ))
            })?;

            let request = IngestBinlogRequest {
                txn_id,
                remote_tablet_id: src_tablet.id,
                binlog_version,
                remote_host: src_backend.host.clone(),
                remote_port: src_backend.http_port.to_string(),
                partition_id: dest_partition_id,
                local_tablet_id: dest_replica.tablet_id,
                load_id: (-1, -1),
            };
            debug!(
                txn_id,
                src_tablet = src_tablet.id,
                dest_tablet = dest_tablet.id,
                dest_backend = dest_backend.id,
                "Plan replica ingest"
            );
            tasks.push(ReplicaIngest {
                be: self.factory.be_rpc(dest_backend)?,
                dest_backend_id: dest_backend.id,
                request,
                commit_info: TabletCommitInfo {
                    tablet_id: dest_replica.tablet_id,
                    backend_id: dest_backend.id,
                },
                stid,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterOps, MetaCache};
    use crate::error::ErrorKind;
    use crate::rpc::{
        BackendsResponse, BeginTxnResponse, DbMetaInfo, FeRpc, GetBinlogResponse, IndexMetaInfo,
        PartitionMetaInfo, ReplicaMetaInfo, RestoreSnapshotRequest, SnapshotResult, Status,
        StatusCode, SubTxnInfo, TableMetaInfo, TableMetaResponse, TabletMetaInfo,
    };
    use async_trait::async_trait;

    struct CatalogFe {
        db: DbMetaInfo,
        backends: Vec<Backend>,
    }

    #[async_trait]
    impl FeRpc for CatalogFe {
        async fn get_binlog(&self, _: &ClusterSpec, _: i64) -> Result<GetBinlogResponse> {
            unimplemented!()
        }
        async fn begin_transaction(&self, _: &ClusterSpec, _: &str, _: &[i64]) -> Result<BeginTxnResponse> {
            unimplemented!()
        }
        async fn begin_transaction_for_txn_insert(
            &self,
            _: &ClusterSpec,
            _: &str,
            _: &[i64],
            _: i64,
        ) -> Result<BeginTxnResponse> {
            unimplemented!()
        }
        async fn commit_transaction(&self, _: &ClusterSpec, _: i64, _: &[TabletCommitInfo]) -> Result<Status> {
            unimplemented!()
        }
        async fn commit_transaction_for_txn_insert(
            &self,
            _: &ClusterSpec,
            _: i64,
            _: &[SubTxnInfo],
        ) -> Result<Status> {
            unimplemented!()
        }
        async fn rollback_transaction(&self, _: &ClusterSpec, _: i64) -> Result<Status> {
            unimplemented!()
        }
        async fn get_snapshot(&self, _: &ClusterSpec, _: &str, _: bool) -> Result<SnapshotResult> {
            unimplemented!()
        }
        async fn restore_snapshot(&self, _: &ClusterSpec, _: &RestoreSnapshotRequest) -> Result<Status> {
            unimplemented!()
        }
        async fn get_backends(&self, _: &ClusterSpec) -> Result<BackendsResponse> {
            Ok(BackendsResponse {
                status: Status::ok(),
                backends: Some(self.backends.clone()),
            })
        }
        async fn get_table_meta(&self, _: &ClusterSpec, _: &[i64]) -> Result<TableMetaResponse> {
            Ok(TableMetaResponse {
                status: Status::ok(),
                db_meta: Some(self.db.clone()),
            })
        }
    }

    #[derive(Default)]
    struct RecordingBe {
        requests: Mutex<Vec<IngestBinlogRequest>>,
        fail_tablet: Option<i64>,
    }

    #[async_trait]
    impl BeRpc for RecordingBe {
        async fn ingest_binlog(&self, request: &IngestBinlogRequest) -> Result<Status> {
            self.requests.lock().unwrap().push(request.clone());
            if Some(request.local_tablet_id) == self.fail_tablet {
                return Ok(Status::error(StatusCode::Other(1), "disk full"));
            }
            Ok(Status::ok())
        }
    }

    struct TestFactory {
        src: Arc<CatalogFe>,
        dest: Arc<CatalogFe>,
        be: Arc<RecordingBe>,
    }

    impl ClusterFactory for TestFactory {
        fn fe_rpc(&self, spec: &ClusterSpec) -> Result<Arc<dyn FeRpc>> {
            if spec.host == "src" {
                Ok(self.src.clone())
            } else {
                Ok(self.dest.clone())
            }
        }
        fn be_rpc(&self, _: &Backend) -> Result<Arc<dyn BeRpc>> {
            Ok(self.be.clone())
        }
        fn cluster_ops(&self, _: &ClusterSpec) -> Arc<dyn ClusterOps> {
            unimplemented!()
        }
        fn meta_cache(&self, _: &ClusterSpec) -> Arc<dyn MetaCache> {
            unimplemented!()
        }
    }

    fn backend(id: i64) -> Backend {
        Backend { id, host: format!("10.0.0.{id}"), be_port: 9060, http_port: 8040, brpc_port: 8060 }
    }

    /// One table with one partition and one base index.
    fn catalog(table_id: i64, partition_id: i64, index_id: i64, tablets: Vec<TabletMetaInfo>) -> DbMetaInfo {
        DbMetaInfo {
            id: 100,
            tables: vec![TableMetaInfo {
                id: table_id,
                name: "orders".into(),
                partitions: vec![PartitionMetaInfo {
                    id: partition_id,
                    name: "p1".into(),
                    range: "[0, 10)".into(),
                    visible_version: 5,
                    indexes: vec![IndexMetaInfo { id: index_id, name: "orders".into(), tablets }],
                }],
            }],
            ..DbMetaInfo::default()
        }
    }

    fn tablet(id: i64, replicas: &[(i64, i64)], version: i64) -> TabletMetaInfo {
        TabletMetaInfo {
            id,
            replicas: replicas
                .iter()
                .map(|(replica_id, backend_id)| ReplicaMetaInfo {
                    id: *replica_id,
                    backend_id: *backend_id,
                    version,
                })
                .collect(),
        }
    }

    fn record(stid: i64) -> TableRecord {
        TableRecord {
            id: 1,
            partition_records: vec![PartitionRecord {
                id: 11,
                range: "[0, 10)".into(),
                version: 5,
                is_temp: false,
                stid,
            }],
            index_ids: vec![21],
        }
    }

    fn specs() -> (ClusterSpec, ClusterSpec) {
        let src = ClusterSpec { host: "src".into(), database: "db".into(), ..ClusterSpec::default() };
        let dest = ClusterSpec { host: "dest".into(), database: "db".into(), ..ClusterSpec::default() };
        (src, dest)
    }

    fn ingester(src_tablets: Vec<TabletMetaInfo>, dest_tablets: Vec<TabletMetaInfo>, be: Arc<RecordingBe>) -> TabletIngester {
        let factory = TestFactory {
            src: Arc::new(CatalogFe { db: catalog(1, 11, 21, src_tablets), backends: vec![backend(1), backend(2)] }),
            dest: Arc::new(CatalogFe { db: catalog(2, 12, 31, dest_tablets), backends: vec![backend(3), backend(4)] }),
            be,
        };
        TabletIngester::new("job", Arc::new(factory), Arc::new(ConcurrencyManager::new(2)))
    }

    #[tokio::test]
    async fn every_dest_replica_is_acknowledged() {
        let be = Arc::new(RecordingBe::default());
        let ingester = ingester(
            vec![tablet(201, &[(1, 1), (2, 2)], 5), tablet(202, &[(3, 1)], 5)],
            vec![tablet(301, &[(5, 3), (6, 4)], 1), tablet(302, &[(7, 3), (8, 4)], 1)],
            be.clone(),
        );
        let (src, dest) = specs();
        let mapping = HashMap::from([(1, 2)]);
        let scope = IngestScope { src: &src, dest: &dest, table_sync: false, table_mapping: &mapping, shadow_indexes: None };

        let outcome = ingester.ingest(scope, 77, &[record(0)], &HashMap::new()).await.unwrap();

        assert_eq!(outcome.commit_infos.len(), 4);
        assert!(outcome.sub_txn_commit_infos.is_empty());
        assert!(outcome.commit_infos.contains(&TabletCommitInfo { tablet_id: 302, backend_id: 4 }));

        let requests = be.requests.lock().unwrap();
        assert_eq!(requests.len(), 4);
        assert!(requests.iter().all(|r| r.txn_id == 77 && r.remote_port == "8040" && r.partition_id == 12));
        // Round robin over the eligible source replicas of tablet 201.
        let hosts: Vec<_> = requests
            .iter()
            .filter(|r| r.remote_tablet_id == 201)
            .map(|r| (r.local_tablet_id, r.remote_host.clone()))
            .collect();
        assert_eq!(hosts.len(), 2);
        assert!(hosts.contains(&(301, "10.0.0.1".to_string())));
        assert!(hosts.contains(&(301, "10.0.0.2".to_string())));
    }

    #[tokio::test]
    async fn tablet_count_mismatch_fails_before_any_rpc() {
        let be = Arc::new(RecordingBe::default());
        let ingester = ingester(
            vec![tablet(201, &[(1, 1)], 5), tablet(202, &[(2, 1)], 5), tablet(203, &[(3, 1)], 5)],
            vec![tablet(301, &[(5, 3)], 1), tablet(302, &[(6, 3)], 1)],
            be.clone(),
        );
        let (src, dest) = specs();
        let mapping = HashMap::from([(1, 2)]);
        let scope = IngestScope { src: &src, dest: &dest, table_sync: false, table_mapping: &mapping, shadow_indexes: None };

        let err = ingester.ingest(scope, 77, &[record(0)], &HashMap::new()).await.unwrap_err();

        assert!(err.is_meta());
        assert!(err.message().contains("src tablets length: 3"));
        assert!(be.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_source_replicas_are_not_eligible() {
        let be = Arc::new(RecordingBe::default());
        let ingester = ingester(vec![tablet(201, &[(1, 1)], 4)], vec![tablet(301, &[(5, 3)], 1)], be.clone());
        let (src, dest) = specs();
        let mapping = HashMap::from([(1, 2)]);
        let scope = IngestScope { src: &src, dest: &dest, table_sync: false, table_mapping: &mapping, shadow_indexes: None };

        let err = ingester.ingest(scope, 77, &[record(0)], &HashMap::new()).await.unwrap_err();

        assert!(err.is_meta());
        assert!(be.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_mapping_is_meta_error() {
        let ingester = ingester(vec![], vec![], Arc::new(RecordingBe::default()));
        let (src, dest) = specs();
        let mapping = HashMap::new();
        let scope = IngestScope { src: &src, dest: &dest, table_sync: false, table_mapping: &mapping, shadow_indexes: None };

        let err = ingester.ingest(scope, 77, &[record(0)], &HashMap::new()).await.unwrap_err();
        assert!(err.is_meta());
    }

    #[tokio::test]
    async fn failed_replica_does_not_stop_siblings() {
        let be = Arc::new(RecordingBe { fail_tablet: Some(301), ..RecordingBe::default() });
        let ingester = ingester(
            vec![tablet(201, &[(1, 1)], 5), tablet(202, &[(2, 1)], 5)],
            vec![tablet(301, &[(5, 3)], 1), tablet(302, &[(6, 3)], 1)],
            be.clone(),
        );
        let (src, dest) = specs();
        let mapping = HashMap::from([(1, 2)]);
        let scope = IngestScope { src: &src, dest: &dest, table_sync: false, table_mapping: &mapping, shadow_indexes: None };

        let err = ingester.ingest(scope, 77, &[record(0)], &HashMap::new()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Be);
        assert_eq!(be.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sub_transactions_group_acknowledgements() {
        let be = Arc::new(RecordingBe::default());
        let ingester = ingester(vec![tablet(201, &[(1, 1)], 5)], vec![tablet(301, &[(5, 3), (6, 4)], 1)], be.clone());
        let (src, dest) = specs();
        let mapping = HashMap::from([(1, 2)]);
        let scope = IngestScope { src: &src, dest: &dest, table_sync: false, table_mapping: &mapping, shadow_indexes: None };

        let outcome = ingester
            .ingest(scope, 77, &[record(9)], &HashMap::from([(9, 900)]))
            .await
            .unwrap();

        assert_eq!(outcome.sub_txn_commit_infos[&900].len(), 2);
        assert!(be.requests.lock().unwrap().iter().all(|r| r.txn_id == 900));
    }

    #[tokio::test]
    async fn shadow_indexes_are_skipped() {
        let be = Arc::new(RecordingBe::default());
        let ingester = ingester(vec![tablet(201, &[(1, 1)], 5)], vec![tablet(301, &[(5, 3)], 1)], be.clone());
        let (src, dest) = specs();
        let mapping = HashMap::from([(1, 2)]);
        let shadow = HashMap::from([(21, 20)]);
        let scope = IngestScope {
            src: &src,
            dest: &dest,
            table_sync: false,
            table_mapping: &mapping,
            shadow_indexes: Some(&shadow),
        };

        let outcome = ingester.ingest(scope, 77, &[record(0)], &HashMap::new()).await.unwrap();
        assert!(outcome.commit_infos.is_empty());
        assert!(be.requests.lock().unwrap().is_empty());
    }
}

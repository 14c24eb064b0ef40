//! Test utilities for job scenarios.
//!
//! Provides an in-memory SQLite job store with migrations applied, and
//! scripted fake clusters that answer frontend, backend, statement and
//! catalog calls while recording what the job asked for.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ccr_syncer::cluster::{
    BackupOutcome, ClusterFactory, ClusterOps, ClusterSpec, MetaCache, RestoreProgress, TableInfo,
};
use ccr_syncer::config::AppConfig;
use ccr_syncer::error::{Result as SyncResult, SyncError};
use ccr_syncer::job::{Job, JobContext, JobInfo};
use ccr_syncer::record::{
    AddPartition, AlterView, CreateTable, DropPartition, IndexChangeJob, ModifyComment,
    ModifyTableAddOrDropColumns, ModifyTableAddOrDropInvertedIndices, ModifyTableProperty,
    RenameColumn, RenameTable, TableType, TruncateTable,
};
use ccr_syncer::rpc::{
    Backend, BackendsResponse, BeRpc, BeginTxnResponse, Binlog, BinlogType, DbMetaInfo, FeRpc,
    GetBinlogResponse, IndexMetaInfo, IngestBinlogRequest, PartitionMetaInfo, ReplicaMetaInfo,
    RestoreSnapshotRequest, SnapshotResult, Status, StatusCode, SubTxnInfo, TableMetaInfo,
    TableMetaResponse, TabletCommitInfo, TabletMetaInfo,
};
use ccr_syncer::storage::{JobStore, SeaOrmJobStore};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};

pub const SRC_HOST: &str = "10.0.0.1";
pub const DEST_HOST: &str = "10.0.1.1";
pub const TEST_HOST_INFO: &str = "127.0.0.1:9190";
pub const PARTITION_RANGE: &str = "[0, 10)";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Job store over a fresh in-memory database.
pub async fn setup_store() -> Result<Arc<dyn JobStore>> {
    let db = setup_test_db().await?;
    Ok(Arc::new(SeaOrmJobStore::new(Arc::new(db))))
}

/// Configuration with short retry delays.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.host_info = TEST_HOST_INFO.to_string();
    config.sync.tick_interval_seconds = 1;
    config.sync.persist_retry_ms = 10;
    config
}

pub fn job_context(store: Arc<dyn JobStore>, factory: Arc<FakeFactory>) -> JobContext {
    JobContext::new(store, factory, &test_config())
}

pub fn job_context_with(
    store: Arc<dyn JobStore>,
    factory: Arc<FakeFactory>,
    config: &AppConfig,
) -> JobContext {
    JobContext::new(store, factory, config)
}

/// Rebuild a job from its stored descriptor, the way a restarted process does.
pub async fn reload_job(ctx: JobContext, name: &str) -> Result<Job> {
    let data = ctx
        .store
        .get_job_info(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {name} not stored"))?;
    let job = Job::from_json(&data, ctx)?;
    job.init().await?;
    Ok(job)
}

/// Poll until `done` holds, failing after two seconds.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn cluster_spec(host: &str, database: &str, table: &str) -> ClusterSpec {
    ClusterSpec {
        host: host.to_string(),
        port: "9030".to_string(),
        thrift_port: "9020".to_string(),
        user: "root".to_string(),
        password: "secret".to_string(),
        database: database.to_string(),
        table: table.to_string(),
        ..ClusterSpec::default()
    }
}

/// Create, validate, persist and initialise a job the way the manager does,
/// without spawning its run loop.
pub async fn start_job(info: JobInfo, ctx: JobContext) -> Result<Job> {
    let store = ctx.store.clone();
    let job = Job::create(info, ctx).await?;
    job.first_run().await?;
    let data = job.info().await.to_json()?;
    store.add_job(job.name(), &data, TEST_HOST_INFO).await?;
    job.init().await?;
    Ok(job)
}

/// Stored progress of a job as loose JSON.
pub async fn stored_progress(store: &Arc<dyn JobStore>, name: &str) -> Result<serde_json::Value> {
    let data = store
        .get_progress(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("progress of {name} not stored"))?;
    Ok(serde_json::from_str(&data)?)
}

pub fn backend(id: i64, host: &str) -> Backend {
    Backend {
        id,
        host: host.to_string(),
        be_port: 9060,
        http_port: 8040,
        brpc_port: 8060,
    }
}

/// One table with one partition, one base index and one single-replica
/// tablet. Ids are derived from `table_id`: partition `+1`, index `+2`,
/// tablet `+3`, replica `+4`.
pub fn single_tablet_table(table_id: i64, name: &str, backend_id: i64, version: i64) -> TableMetaInfo {
    TableMetaInfo {
        id: table_id,
        name: name.to_string(),
        partitions: vec![PartitionMetaInfo {
            id: table_id + 1,
            name: format!("p_{name}"),
            range: PARTITION_RANGE.to_string(),
            visible_version: version,
            indexes: vec![IndexMetaInfo {
                id: table_id + 2,
                name: name.to_string(),
                tablets: vec![TabletMetaInfo {
                    id: table_id + 3,
                    replicas: vec![ReplicaMetaInfo {
                        id: table_id + 4,
                        backend_id,
                        version,
                    }],
                }],
            }],
        }],
    }
}

/// A finished snapshot whose job info is `job_info`.
pub fn snapshot_result(job_info: serde_json::Value, commit_seq: i64) -> SnapshotResult {
    SnapshotResult {
        status: Status::ok(),
        meta: b"{}".to_vec(),
        job_info: job_info.to_string().into_bytes(),
        expired_at: 0,
        commit_seq,
        compressed: false,
    }
}

/// Upsert of one version into the partition of a [`single_tablet_table`].
pub fn upsert_binlog(commit_seq: i64, table_id: i64, version: i64) -> Binlog {
    let data = serde_json::json!({
        "commitSeq": commit_seq,
        "txnId": commit_seq * 10,
        "label": format!("insert_{commit_seq}"),
        "dbId": 1,
        "tableRecords": {
            table_id.to_string(): {
                "partitionRecords": [{
                    "partitionId": table_id + 1,
                    "range": PARTITION_RANGE,
                    "version": version,
                }],
                "indexIds": [table_id + 2],
            }
        },
    });
    Binlog::new(commit_seq, BinlogType::Upsert, data.to_string())
}

pub fn truncate_binlog(commit_seq: i64, table_id: i64, table: &str) -> Binlog {
    let data = serde_json::json!({
        "dbId": 1,
        "db": "src_db",
        "tblId": table_id,
        "table": table,
        "isEntireTable": true,
        "rawSql": "",
    });
    Binlog::new(commit_seq, BinlogType::TruncateTable, data.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scripted cluster: frontend, statements and catalog cache in one.
pub struct FakeCluster {
    db_id: i64,
    calls: Mutex<Vec<String>>,
    tables: Mutex<BTreeMap<i64, TableInfo>>,
    catalog: Mutex<DbMetaInfo>,
    backends: Mutex<Vec<Backend>>,
    binlogs: Mutex<VecDeque<Binlog>>,
    snapshot: Mutex<Option<SnapshotResult>>,
    restore_progress: Mutex<RestoreProgress>,
    table_meta_status: Mutex<Status>,
    restores: Mutex<Vec<RestoreSnapshotRequest>>,
    snapshots: Mutex<Vec<String>>,
    commits: Mutex<Vec<Vec<TabletCommitInfo>>>,
    commit_status: Mutex<Status>,
    rollback_status: Mutex<Status>,
    failures: Mutex<HashMap<String, String>>,
    next_txn_id: AtomicI64,
    scope_table_exists: AtomicBool,
    backup_finished: AtomicBool,
    hold_commits: AtomicBool,
}

impl FakeCluster {
    pub fn new(db_id: i64) -> Self {
        Self {
            db_id,
            calls: Mutex::new(Vec::new()),
            tables: Mutex::new(BTreeMap::new()),
            catalog: Mutex::new(DbMetaInfo {
                id: db_id,
                ..DbMetaInfo::default()
            }),
            backends: Mutex::new(Vec::new()),
            binlogs: Mutex::new(VecDeque::new()),
            snapshot: Mutex::new(None),
            restore_progress: Mutex::new(RestoreProgress::Finished),
            table_meta_status: Mutex::new(Status::ok()),
            restores: Mutex::new(Vec::new()),
            snapshots: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
            commit_status: Mutex::new(Status::ok()),
            rollback_status: Mutex::new(Status::ok()),
            failures: Mutex::new(HashMap::new()),
            next_txn_id: AtomicI64::new(1000),
            scope_table_exists: AtomicBool::new(false),
            backup_finished: AtomicBool::new(true),
            hold_commits: AtomicBool::new(false),
        }
    }

    /// Register a table in the catalog cache and, for OLAP tables, its tablet tree.
    pub fn add_table(&self, table: TableMetaInfo, table_type: TableType) {
        let is_olap = table_type == TableType::Olap;
        lock(&self.tables).insert(
            table.id,
            TableInfo {
                id: table.id,
                name: table.name.clone(),
                table_type,
            },
        );
        if is_olap {
            lock(&self.catalog).tables.push(table);
        }
    }

    pub fn set_backends(&self, backends: Vec<Backend>) {
        *lock(&self.backends) = backends;
    }

    pub fn set_scope_table_exists(&self, exists: bool) {
        self.scope_table_exists.store(exists, Ordering::SeqCst);
    }

    pub fn push_binlog(&self, binlog: Binlog) {
        lock(&self.binlogs).push_back(binlog);
    }

    pub fn set_snapshot(&self, snapshot: SnapshotResult) {
        *lock(&self.snapshot) = Some(snapshot);
    }

    pub fn set_restore_progress(&self, progress: RestoreProgress) {
        *lock(&self.restore_progress) = progress;
    }

    pub fn fail_table_meta(&self, status: Status) {
        *lock(&self.table_meta_status) = status;
    }

    /// Status answered by the next commits.
    pub fn set_commit_status(&self, status: Status) {
        *lock(&self.commit_status) = status;
    }

    /// Status answered by the next rollbacks.
    pub fn set_rollback_status(&self, status: Status) {
        *lock(&self.rollback_status) = status;
    }

    /// Commits are recorded, then block until released.
    pub fn hold_commits(&self, hold: bool) {
        self.hold_commits.store(hold, Ordering::SeqCst);
    }

    pub fn set_backup_finished(&self, finished: bool) {
        self.backup_finished.store(finished, Ordering::SeqCst);
    }

    /// Make every call to the statement `method` fail with `message`.
    pub fn fail_call(&self, method: &str, message: &str) {
        lock(&self.failures).insert(method.to_string(), message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// How often a call whose record starts with `prefix` was made.
    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn restores(&self) -> Vec<RestoreSnapshotRequest> {
        lock(&self.restores).clone()
    }

    pub fn commits(&self) -> Vec<Vec<TabletCommitInfo>> {
        lock(&self.commits).clone()
    }

    fn record(&self, call: impl Into<String>) {
        lock(&self.calls).push(call.into());
    }

    fn scripted_failure(&self, method: &str) -> SyncResult<()> {
        match lock(&self.failures).get(method) {
            Some(message) => Err(SyncError::normal(message.clone())),
            None => Ok(()),
        }
    }

    fn table_by_name(&self, name: &str) -> Option<TableInfo> {
        lock(&self.tables)
            .values()
            .find(|table| table.name == name)
            .cloned()
    }
}

#[async_trait]
impl FeRpc for FakeCluster {
    async fn get_binlog(&self, _: &ClusterSpec, commit_seq: i64) -> SyncResult<GetBinlogResponse> {
        self.record(format!("get_binlog {commit_seq}"));
        // Entries stay queued so a resumed job can read them again.
        let binlogs: Vec<Binlog> = lock(&self.binlogs)
            .iter()
            .filter(|binlog| binlog.commit_seq > commit_seq)
            .cloned()
            .collect();
        if binlogs.is_empty() {
            return Ok(GetBinlogResponse {
                status: Status::error(StatusCode::BinlogTooNewCommitSeq, "no new binlog"),
                binlogs: Vec::new(),
            });
        }
        Ok(GetBinlogResponse {
            status: Status::ok(),
            binlogs,
        })
    }

    async fn begin_transaction(
        &self,
        _: &ClusterSpec,
        label: &str,
        table_ids: &[i64],
    ) -> SyncResult<BeginTxnResponse> {
        self.record(format!("begin_transaction {table_ids:?}"));
        assert!(label.starts_with("ccrj-"), "unexpected txn label {label}");
        Ok(BeginTxnResponse {
            status: Status::ok(),
            txn_id: self.next_txn_id.fetch_add(1, Ordering::SeqCst),
            db_id: self.db_id,
            sub_txn_ids: Vec::new(),
        })
    }

    async fn begin_transaction_for_txn_insert(
        &self,
        _: &ClusterSpec,
        _: &str,
        table_ids: &[i64],
        sub_txn_count: i64,
    ) -> SyncResult<BeginTxnResponse> {
        self.record(format!("begin_transaction_for_txn_insert {table_ids:?}"));
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Ok(BeginTxnResponse {
            status: Status::ok(),
            txn_id,
            db_id: self.db_id,
            sub_txn_ids: (1..=sub_txn_count).map(|i| txn_id * 100 + i).collect(),
        })
    }

    async fn commit_transaction(
        &self,
        _: &ClusterSpec,
        txn_id: i64,
        commit_infos: &[TabletCommitInfo],
    ) -> SyncResult<Status> {
        self.record(format!("commit_transaction {txn_id}"));
        while self.hold_commits.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = lock(&self.commit_status).clone();
        if status.is_ok() {
            lock(&self.commits).push(commit_infos.to_vec());
        }
        Ok(status)
    }

    async fn commit_transaction_for_txn_insert(
        &self,
        _: &ClusterSpec,
        txn_id: i64,
        _: &[SubTxnInfo],
    ) -> SyncResult<Status> {
        self.record(format!("commit_transaction_for_txn_insert {txn_id}"));
        Ok(Status::ok())
    }

    async fn rollback_transaction(&self, _: &ClusterSpec, txn_id: i64) -> SyncResult<Status> {
        self.record(format!("rollback_transaction {txn_id}"));
        Ok(lock(&self.rollback_status).clone())
    }

    async fn get_snapshot(
        &self,
        _: &ClusterSpec,
        snapshot_name: &str,
        _: bool,
    ) -> SyncResult<SnapshotResult> {
        self.record(format!("get_snapshot {snapshot_name}"));
        Ok(lock(&self.snapshot).clone().unwrap_or_else(|| SnapshotResult {
            status: Status::error(StatusCode::SnapshotNotExist, "snapshot not exist"),
            ..SnapshotResult::default()
        }))
    }

    async fn restore_snapshot(
        &self,
        _: &ClusterSpec,
        request: &RestoreSnapshotRequest,
    ) -> SyncResult<Status> {
        self.record(format!("restore_snapshot {}", request.snapshot_name));
        lock(&self.restores).push(request.clone());
        Ok(Status::ok())
    }

    async fn get_backends(&self, _: &ClusterSpec) -> SyncResult<BackendsResponse> {
        Ok(BackendsResponse {
            status: Status::ok(),
            backends: Some(lock(&self.backends).clone()),
        })
    }

    async fn get_table_meta(
        &self,
        _: &ClusterSpec,
        table_ids: &[i64],
    ) -> SyncResult<TableMetaResponse> {
        self.record(format!("get_table_meta {table_ids:?}"));
        let status = lock(&self.table_meta_status).clone();
        if !status.is_ok() {
            return Ok(TableMetaResponse {
                status,
                db_meta: None,
            });
        }

        let catalog = lock(&self.catalog);
        let db_meta = DbMetaInfo {
            id: catalog.id,
            tables: catalog
                .tables
                .iter()
                .filter(|table| table_ids.contains(&table.id))
                .cloned()
                .collect(),
            dropped_partitions: catalog.dropped_partitions.clone(),
            dropped_tables: catalog.dropped_tables.clone(),
            dropped_indexes: catalog.dropped_indexes.clone(),
        };
        Ok(TableMetaResponse {
            status: Status::ok(),
            db_meta: Some(db_meta),
        })
    }
}

#[async_trait]
impl ClusterOps for FakeCluster {
    async fn valid(&self) -> SyncResult<()> {
        Ok(())
    }

    async fn is_database_enable_binlog(&self) -> SyncResult<bool> {
        Ok(true)
    }

    async fn is_enable_restore_snapshot_compression(&self) -> SyncResult<bool> {
        Ok(false)
    }

    async fn get_all_tables(&self) -> SyncResult<Vec<String>> {
        Ok(lock(&self.tables).values().map(|t| t.name.clone()).collect())
    }

    async fn get_all_views_from_table(&self, _: &str) -> SyncResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn create_database(&self) -> SyncResult<()> {
        self.record("create_database");
        Ok(())
    }

    async fn create_table_or_view(&self, create: &CreateTable, _: &str) -> SyncResult<()> {
        self.record(format!("create_table_or_view {}", create.sql));
        Ok(())
    }

    async fn check_database_exists(&self) -> SyncResult<bool> {
        Ok(true)
    }

    async fn check_table_exists(&self) -> SyncResult<bool> {
        Ok(self.scope_table_exists.load(Ordering::SeqCst))
    }

    async fn check_table_exists_by_name(&self, table: &str) -> SyncResult<bool> {
        Ok(self.table_by_name(table).is_some())
    }

    async fn check_table_property_valid(&self) -> SyncResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_valid_backup_job(&self, prefix: &str) -> SyncResult<Option<String>> {
        Ok(lock(&self.snapshots)
            .iter()
            .rev()
            .find(|name| name.starts_with(prefix))
            .cloned())
    }

    async fn get_valid_restore_job(&self, prefix: &str) -> SyncResult<Option<String>> {
        Ok(lock(&self.restores)
            .iter()
            .rev()
            .map(|request| &request.snapshot_name)
            .find(|name| name.starts_with(prefix))
            .cloned())
    }

    async fn cancel_restore_if_exists(&self, name: &str) -> SyncResult<()> {
        self.record(format!("cancel_restore {name}"));
        Ok(())
    }

    async fn create_snapshot(&self, name: &str, tables: &[String]) -> SyncResult<()> {
        self.record(format!("create_snapshot {name} {tables:?}"));
        lock(&self.snapshots).push(name.to_string());
        Ok(())
    }

    async fn create_partial_snapshot(
        &self,
        name: &str,
        table: &str,
        partitions: &[String],
    ) -> SyncResult<BackupOutcome> {
        self.record(format!("create_partial_snapshot {name} {table} {partitions:?}"));
        lock(&self.snapshots).push(name.to_string());
        Ok(BackupOutcome::Created)
    }

    async fn check_backup_finished(&self, _: &str) -> SyncResult<bool> {
        Ok(self.backup_finished.load(Ordering::SeqCst))
    }

    async fn check_restore_finished(&self, _: &str) -> SyncResult<RestoreProgress> {
        Ok(*lock(&self.restore_progress))
    }

    async fn get_restore_signature_not_matched_table_or_view(
        &self,
        _: &str,
    ) -> SyncResult<Option<(String, bool)>> {
        Ok(None)
    }

    async fn wait_transaction_done(&self, txn_id: i64) {
        self.record(format!("wait_transaction_done {txn_id}"));
    }

    async fn lightning_schema_change(
        &self,
        _: &str,
        table_alias: &str,
        _: &ModifyTableAddOrDropColumns,
    ) -> SyncResult<()> {
        self.record(format!("lightning_schema_change {table_alias}"));
        Ok(())
    }

    async fn rename_column(&self, table: &str, _: &RenameColumn) -> SyncResult<()> {
        self.record(format!("rename_column {table}"));
        Ok(())
    }

    async fn rename_table(&self, table: &str, _: &RenameTable) -> SyncResult<()> {
        self.record(format!("rename_table {table}"));
        Ok(())
    }

    async fn rename_table_with_name(&self, old_name: &str, new_name: &str) -> SyncResult<()> {
        self.record(format!("rename_table_with_name {old_name} {new_name}"));
        Ok(())
    }

    async fn modify_comment(&self, table: &str, _: &ModifyComment) -> SyncResult<()> {
        self.record(format!("modify_comment {table}"));
        Ok(())
    }

    async fn modify_table_property(&self, table: &str, _: &ModifyTableProperty) -> SyncResult<()> {
        self.record(format!("modify_table_property {table}"));
        Ok(())
    }

    async fn truncate_table(&self, table: &str, _: &TruncateTable) -> SyncResult<()> {
        self.record(format!("truncate_table {table}"));
        Ok(())
    }

    async fn replace_table(&self, from: &str, to: &str, swap: bool) -> SyncResult<()> {
        self.record(format!("replace_table {from} {to} {swap}"));
        Ok(())
    }

    async fn drop_table(&self, table: &str, force: bool) -> SyncResult<()> {
        self.record(format!("drop_table {table} {force}"));
        self.scripted_failure("drop_table")
    }

    async fn drop_view(&self, view: &str) -> SyncResult<()> {
        self.record(format!("drop_view {view}"));
        self.scripted_failure("drop_view")
    }

    async fn alter_view_def(&self, _: &str, view: &str, _: &AlterView) -> SyncResult<()> {
        self.record(format!("alter_view_def {view}"));
        Ok(())
    }

    async fn add_partition(&self, table: &str, _: &AddPartition) -> SyncResult<()> {
        self.record(format!("add_partition {table}"));
        Ok(())
    }

    async fn drop_partition(&self, table: &str, _: &DropPartition) -> SyncResult<()> {
        self.record(format!("drop_partition {table}"));
        Ok(())
    }

    async fn rename_partition(&self, table: &str, old_name: &str, new_name: &str) -> SyncResult<()> {
        self.record(format!("rename_partition {table} {old_name} {new_name}"));
        Ok(())
    }

    async fn lightning_index_change(
        &self,
        table: &str,
        _: &ModifyTableAddOrDropInvertedIndices,
    ) -> SyncResult<()> {
        self.record(format!("lightning_index_change {table}"));
        Ok(())
    }

    async fn build_index(&self, table: &str, _: &IndexChangeJob) -> SyncResult<()> {
        self.record(format!("build_index {table}"));
        Ok(())
    }

    async fn rename_rollup(&self, table: &str, old_name: &str, new_name: &str) -> SyncResult<()> {
        self.record(format!("rename_rollup {table} {old_name} {new_name}"));
        Ok(())
    }

    async fn drop_rollup(&self, table: &str, rollup: &str) -> SyncResult<()> {
        self.record(format!("drop_rollup {table} {rollup}"));
        Ok(())
    }

    async fn desync_tables(&self, tables: &[String]) -> SyncResult<()> {
        self.record(format!("desync_tables {tables:?}"));
        Ok(())
    }
}

#[async_trait]
impl MetaCache for FakeCluster {
    async fn get_db_id(&self) -> SyncResult<i64> {
        Ok(self.db_id)
    }

    async fn get_table_id(&self, name: &str) -> SyncResult<i64> {
        self.table_by_name(name)
            .map(|table| table.id)
            .ok_or_else(|| SyncError::meta(format!("table {name} not found")))
    }

    async fn get_table_name_by_id(&self, id: i64) -> SyncResult<String> {
        Ok(lock(&self.tables)
            .get(&id)
            .map(|table| table.name.clone())
            .unwrap_or_default())
    }

    async fn get_table(&self, id: i64) -> SyncResult<TableInfo> {
        lock(&self.tables)
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::meta(format!("table id {id} not found")))
    }

    async fn get_tables(&self) -> SyncResult<BTreeMap<i64, TableInfo>> {
        Ok(lock(&self.tables).clone())
    }

    fn dirty_get_tables(&self) -> BTreeMap<i64, TableInfo> {
        lock(&self.tables).clone()
    }

    async fn update_table(&self, name: &str, _: i64) -> SyncResult<TableInfo> {
        self.table_by_name(name)
            .ok_or_else(|| SyncError::meta(format!("table {name} not found")))
    }

    fn clear_tables_cache(&self) {}

    fn clear_table(&self, _: &str, _: &str) {}

    async fn get_backends(&self) -> SyncResult<Vec<Backend>> {
        Ok(lock(&self.backends).clone())
    }

    async fn get_master_token(&self) -> SyncResult<String> {
        Ok("master-token".to_string())
    }

    async fn check_binlog_feature(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// Backend that acknowledges every ingest request.
#[derive(Default)]
pub struct FakeBackend {
    requests: Mutex<Vec<IngestBinlogRequest>>,
}

impl FakeBackend {
    pub fn requests(&self) -> Vec<IngestBinlogRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl BeRpc for FakeBackend {
    async fn ingest_binlog(&self, request: &IngestBinlogRequest) -> SyncResult<Status> {
        lock(&self.requests).push(request.clone());
        Ok(Status::ok())
    }
}

/// Routes specs to the source or destination fake by host.
pub struct FakeFactory {
    pub src: Arc<FakeCluster>,
    pub dest: Arc<FakeCluster>,
    backends: Mutex<HashMap<i64, Arc<FakeBackend>>>,
}

impl FakeFactory {
    pub fn new(src: FakeCluster, dest: FakeCluster) -> Self {
        Self {
            src: Arc::new(src),
            dest: Arc::new(dest),
            backends: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self, id: i64) -> Arc<FakeBackend> {
        lock(&self.backends).entry(id).or_default().clone()
    }

    fn cluster(&self, spec: &ClusterSpec) -> Arc<FakeCluster> {
        if spec.host == SRC_HOST {
            self.src.clone()
        } else {
            self.dest.clone()
        }
    }
}

impl ClusterFactory for FakeFactory {
    fn fe_rpc(&self, spec: &ClusterSpec) -> SyncResult<Arc<dyn FeRpc>> {
        let fe: Arc<dyn FeRpc> = self.cluster(spec);
        Ok(fe)
    }

    fn be_rpc(&self, backend: &Backend) -> SyncResult<Arc<dyn BeRpc>> {
        let be: Arc<dyn BeRpc> = self.backend(backend.id);
        Ok(be)
    }

    fn cluster_ops(&self, spec: &ClusterSpec) -> Arc<dyn ClusterOps> {
        self.cluster(spec)
    }

    fn meta_cache(&self, spec: &ClusterSpec) -> Arc<dyn MetaCache> {
        self.cluster(spec)
    }
}

/// Source table `t` (id 100) on backend 1 and destination table `t`
/// (id 200) on backend 2, both at version 7.
pub fn table_sync_factory() -> FakeFactory {
    let src = FakeCluster::new(1);
    src.add_table(single_tablet_table(100, "t", 1, 7), TableType::Olap);
    src.set_backends(vec![backend(1, "10.0.0.11")]);
    src.set_scope_table_exists(true);
    src.set_snapshot(snapshot_result(
        serde_json::json!({
            "backup_objects": { "t": { "id": 100 } },
            "table_commit_seq_map": { "100": 50 },
        }),
        50,
    ));

    let dest = FakeCluster::new(2);
    dest.add_table(single_tablet_table(200, "t", 2, 1), TableType::Olap);
    dest.set_backends(vec![backend(2, "10.0.1.11")]);

    FakeFactory::new(src, dest)
}

pub fn table_sync_info(name: &str) -> JobInfo {
    JobInfo::new(
        name,
        cluster_spec(SRC_HOST, "src_db", "t"),
        cluster_spec(DEST_HOST, "dest_db", "t"),
    )
}

//! # Replication Job
//!
//! A job replicates one source database or table into a destination cluster.
//! It owns a [`JobProgress`] cursor and advances it one tick at a time:
//!
//! - **Full sync**: back up the source, restore it on the destination and
//!   anchor the watermark at the snapshot's commit sequence.
//! - **Partial sync**: the same protocol, scoped to one table or a set of
//!   partitions.
//! - **Incremental sync**: pull changelog entries after the watermark and
//!   replay each one on the destination.
//!
//! Operator commands (pause, resume, skip, host mapping, desync) go through
//! [`Job`]; they take the same lock as the run loop, so a command never
//! observes a half-applied tick.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{ClusterFactory, ClusterOps, ClusterSpec, MetaCache};
use crate::config::{AppConfig, FeatureFlags, SyncConfig};
use crate::error::{ErrorKind, Result, SyncError};
use crate::ingest::TabletIngester;
use crate::progress::{JobProgress, ProgressPersister, SubSyncState, SyncState};
use crate::rpc::ConcurrencyManager;
use crate::storage::JobStore;
use crate::telemetry;

mod dispatch;
pub mod label;
mod snapshot;
mod upsert;

/// Scope of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum SyncType {
    DbSync,
    TableSync,
}

impl From<SyncType> for i32 {
    fn from(sync_type: SyncType) -> Self {
        match sync_type {
            SyncType::DbSync => 0,
            SyncType::TableSync => 1,
        }
    }
}

impl TryFrom<i32> for SyncType {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(SyncType::DbSync),
            1 => Ok(SyncType::TableSync),
            other => Err(format!("unknown sync type: {other}")),
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncType::DbSync => f.write_str("db_sync"),
            SyncType::TableSync => f.write_str("table_sync"),
        }
    }
}

/// Operator-controlled run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum JobState {
    Running,
    Paused,
}

impl From<JobState> for i32 {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Running => 0,
            JobState::Paused => 1,
        }
    }
}

impl TryFrom<i32> for JobState {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(JobState::Running),
            1 => Ok(JobState::Paused),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Running => f.write_str("running"),
            JobState::Paused => f.write_str("paused"),
        }
    }
}

/// How a requested skip of a changelog entry is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipBy {
    /// Skip exactly one entry without replaying it.
    #[serde(rename = "silence")]
    Silence,
    /// Skip by starting over with a full snapshot.
    #[serde(rename = "fullsync")]
    FullSync,
}

impl FromStr for SkipBy {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "silence" => Ok(SkipBy::Silence),
            "fullsync" => Ok(SkipBy::FullSync),
            other => Err(SyncError::normal(format!("unknown skip by: {other}"))),
        }
    }
}

/// Optional job settings persisted with the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExtra {
    /// Reuse the source transaction label for destination transactions.
    #[serde(default, skip_serializing_if = "is_false")]
    pub reuse_binlog_label: bool,
    /// Accept an existing destination table on first run (table scope).
    #[serde(skip)]
    pub allow_table_exists: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_binlog: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub skip_commit_seq: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_by: Option<SkipBy>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Persisted job descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,
    pub sync_type: SyncType,
    pub src: ClusterSpec,
    pub dest: ClusterSpec,
    pub state: JobState,
    #[serde(flatten)]
    pub extra: JobExtra,
}

impl JobInfo {
    /// Descriptor of a new running job. The scope follows `src.table`.
    pub fn new(name: impl Into<String>, src: ClusterSpec, dest: ClusterSpec) -> Self {
        let sync_type = if src.is_table_scope() {
            SyncType::TableSync
        } else {
            SyncType::DbSync
        };
        Self {
            name: name.into(),
            sync_type,
            src,
            dest,
            state: JobState::Running,
            extra: JobExtra::default(),
        }
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| SyncError::wrap(ErrorKind::Normal, "unmarshal job info failed", e))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn is_table_sync_with_alias(&self) -> bool {
        self.sync_type == SyncType::TableSync && self.src.table != self.dest.table
    }
}

/// Point-in-time view of a job for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub state: String,
    pub progress_state: String,
}

/// Shared collaborators handed to every job.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn JobStore>,
    pub factory: Arc<dyn ClusterFactory>,
    pub features: FeatureFlags,
    pub sync: SyncConfig,
}

impl JobContext {
    pub fn new(store: Arc<dyn JobStore>, factory: Arc<dyn ClusterFactory>, config: &AppConfig) -> Self {
        Self {
            store,
            factory,
            features: config.features,
            sync: config.sync.clone(),
        }
    }

    fn persister(&self) -> ProgressPersister {
        ProgressPersister::new(self.store.clone(), self.sync.persist_retry_delay())
    }
}

/// A replication job and its run loop.
pub struct Job {
    name: String,
    sync_type: SyncType,
    ctx: JobContext,
    core: Mutex<JobCore>,
    cancel: CancellationToken,
    deleted: AtomicBool,
    raw_state: AtomicI32,
    raw_progress_state: AtomicI32,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("sync_type", &self.sync_type)
            .field("state", &status.state)
            .field("progress_state", &status.progress_state)
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Validate a new job against the store and both clusters.
    pub async fn create(info: JobInfo, ctx: JobContext) -> Result<Self> {
        if info.name.is_empty() {
            return Err(SyncError::normal("name is empty"));
        }
        if ctx.store.is_job_exist(&info.name).await? {
            return Err(SyncError::normal(format!("job {} already exist", info.name)));
        }
        if info.src.is_table_scope() != info.dest.is_table_scope() {
            return Err(SyncError::normal("src/dest are not both db or table sync"));
        }

        let job = Self::new(info, ctx);
        {
            let core = job.core.lock().await;
            core.src_ops.valid().await?;
            core.dest_ops.valid().await?;
        }
        Ok(job)
    }

    /// Rebuild a job from its stored descriptor.
    pub fn from_json(data: &str, ctx: JobContext) -> Result<Self> {
        Ok(Self::new(JobInfo::from_json(data)?, ctx))
    }

    fn new(info: JobInfo, ctx: JobContext) -> Self {
        let name = info.name.clone();
        let sync_type = info.sync_type;
        let raw_state = AtomicI32::new(info.state.into());
        let cancel = CancellationToken::new();
        let core = JobCore::new(info, ctx.clone(), cancel.clone());
        let raw_progress_state = AtomicI32::new(core.progress.sync_state.into());
        Self {
            name,
            sync_type,
            ctx,
            core: Mutex::new(core),
            cancel,
            deleted: AtomicBool::new(false),
            raw_state,
            raw_progress_state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sync_type(&self) -> SyncType {
        self.sync_type
    }

    pub async fn info(&self) -> JobInfo {
        self.core.lock().await.info.clone()
    }

    /// One-time checks and setup before the job is persisted.
    pub async fn first_run(&self) -> Result<()> {
        self.core.lock().await.first_run().await
    }

    /// Load or create the progress. Must precede the first tick.
    pub async fn init(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        core.init_progress().await?;
        self.update_status(&core);
        Ok(())
    }

    /// Drive the job until it is stopped or deleted.
    #[instrument(skip_all, fields(job = %self.name))]
    pub async fn run(&self) -> Result<()> {
        self.init().await?;
        info!(sync_type = %self.sync_type, "Job started");

        let tick_interval = self.ctx.sync.tick_interval();
        loop {
            if self.maybe_deleted().await {
                return Ok(());
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if !self.maybe_deleted().await {
                        info!("Job stopped");
                    }
                    return Ok(());
                }
                _ = sleep(tick_interval) => {
                    if let Err(err) = self.tick().await {
                        warn!(error = %err, "Job sync failed");
                    }
                }
            }
        }
    }

    /// Run one step of the current phase. Skipped while paused or panicked.
    pub async fn tick(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.info.state != JobState::Running {
            return Ok(());
        }
        if let Some(reason) = &core.panic_error {
            error!(job = %self.name, error = %reason, "Job panicked, waiting for operator");
            return Ok(());
        }

        let tick_started = Instant::now();
        let result = core.sync().await;
        self.update_status(&core);
        telemetry::record_tick_duration(
            &self.name,
            tick_started.elapsed().as_secs_f64() * 1_000.0,
        );

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                core.handle_error(&err).await;
                self.update_status(&core);
                Err(err)
            }
        }
    }

    /// Remove the job from the store once deletion was requested.
    async fn maybe_deleted(&self) -> bool {
        if !self.deleted.load(Ordering::SeqCst) {
            return false;
        }
        if let Err(err) = self.ctx.store.remove_job(&self.name).await {
            error!(error = %err, "Remove deleted job failed");
        }
        info!("Job deleted");
        true
    }

    /// Stop the run loop without touching the store.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the run loop; the loop removes the job from the store on exit.
    pub fn delete(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub async fn pause(&self) -> Result<()> {
        self.change_state(JobState::Paused).await
    }

    /// Resume ticking; also clears a panic latch.
    pub async fn resume(&self) -> Result<()> {
        self.change_state(JobState::Running).await?;
        if let Some(reason) = self.core.lock().await.panic_error.take() {
            info!(job = %self.name, error = %reason, "Panic latch cleared");
        }
        Ok(())
    }

    async fn change_state(&self, state: JobState) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.info.state == state {
            debug!(job = %self.name, state = %state, "Job state unchanged");
            return Ok(());
        }

        let origin = core.info.state;
        core.info.state = state;
        if let Err(err) = core.persist_job().await {
            core.info.state = origin;
            return Err(err);
        }
        info!(job = %self.name, from = %origin, to = %state, "Change job state");
        self.update_status(&core);
        Ok(())
    }

    pub fn status(&self) -> JobStatus {
        let state = JobState::try_from(self.raw_state.load(Ordering::SeqCst))
            .map(|s| s.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let progress_state = SyncState::try_from(self.raw_progress_state.load(Ordering::SeqCst))
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        JobStatus {
            name: self.name.clone(),
            state,
            progress_state,
        }
    }

    fn update_status(&self, core: &JobCore) {
        self.raw_state.store(core.info.state.into(), Ordering::SeqCst);
        self.raw_progress_state
            .store(core.progress.sync_state.into(), Ordering::SeqCst);
    }

    /// Replace host mappings; an empty public host removes the entry.
    pub async fn update_host_mapping(
        &self,
        src_mapping: HashMap<String, String>,
        dest_mapping: HashMap<String, String>,
    ) -> Result<()> {
        let mut core = self.core.lock().await;
        let origin_src = core.info.src.host_mapping.clone();
        let origin_dest = core.info.dest.host_mapping.clone();

        apply_host_mapping(&mut core.info.src, src_mapping);
        apply_host_mapping(&mut core.info.dest, dest_mapping);
        if let Err(err) = core.persist_job().await {
            core.info.src.host_mapping = origin_src;
            core.info.dest.host_mapping = origin_dest;
            return Err(err);
        }
        Ok(())
    }

    /// Request a skip of the entry at `commit_seq`.
    pub async fn skip_binlog(&self, commit_seq: i64, skip_by: SkipBy) -> Result<()> {
        let mut core = self.core.lock().await;
        let origin = core.info.extra.clone();

        info!(job = %self.name, commit_seq, skip_by = ?skip_by, "Skip binlog requested");
        core.info.extra.skip_binlog = true;
        core.info.extra.skip_commit_seq = commit_seq;
        core.info.extra.skip_by = Some(skip_by);
        if let Err(err) = core.persist_job().await {
            core.info.extra = origin;
            return Err(err);
        }
        Ok(())
    }

    /// Detach the replicated destination tables so they become writable.
    pub async fn desync(&self) -> Result<()> {
        self.core.lock().await.desync().await
    }
}

fn apply_host_mapping(spec: &mut ClusterSpec, updates: HashMap<String, String>) {
    let mapping = spec.host_mapping.get_or_insert_with(HashMap::new);
    for (private, public) in updates {
        if public.is_empty() {
            mapping.remove(&private);
        } else {
            mapping.insert(private, public);
        }
    }
}

/// Mutable state of a job; every tick and command runs against it under the job lock.
pub(crate) struct JobCore {
    info: JobInfo,
    progress: JobProgress,
    ctx: JobContext,
    src_ops: Arc<dyn ClusterOps>,
    dest_ops: Arc<dyn ClusterOps>,
    src_meta: Arc<dyn MetaCache>,
    dest_meta: Arc<dyn MetaCache>,
    ingester: TabletIngester,
    /// Source table ids known to be materialized views.
    mv_tables: HashSet<i64>,
    /// Set by a panic error; ticks stop until the job is resumed.
    panic_error: Option<String>,
    /// Cancelled when the job is stopped or deleted; retry loops give up on it.
    cancel: CancellationToken,
}

impl JobCore {
    fn new(info: JobInfo, ctx: JobContext, cancel: CancellationToken) -> Self {
        let factory = ctx.factory.clone();
        let concurrency = Arc::new(ConcurrencyManager::new(
            ctx.sync.max_ingest_concurrency_per_backend,
        ));
        Self {
            progress: JobProgress::new(&info.name, info.sync_type, ctx.persister()),
            src_ops: factory.cluster_ops(&info.src),
            dest_ops: factory.cluster_ops(&info.dest),
            src_meta: factory.meta_cache(&info.src),
            dest_meta: factory.meta_cache(&info.dest),
            ingester: TabletIngester::new(info.name.clone(), factory, concurrency),
            mv_tables: HashSet::new(),
            panic_error: None,
            cancel,
            info,
            ctx,
        }
    }

    fn name(&self) -> &str {
        &self.info.name
    }

    fn features(&self) -> FeatureFlags {
        self.ctx.features
    }

    fn is_table_sync(&self) -> bool {
        self.info.sync_type == SyncType::TableSync
    }

    /// Sleep before the next attempt of a retry loop. Fails once the job is
    /// stopped so the loop releases the job lock.
    async fn retry_backoff(&self, delay: std::time::Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::normal(format!(
                "job {} is stopped, give up retrying",
                self.info.name
            ))),
            _ = sleep(delay) => Ok(()),
        }
    }

    async fn persist_job(&self) -> Result<()> {
        let data = self.info.to_json()?;
        self.ctx.store.update_job(&self.info.name, &data).await
    }

    async fn first_run(&mut self) -> Result<()> {
        info!(job = %self.name(), "Job first run");

        self.src_meta.check_binlog_feature().await?;
        self.dest_meta.check_binlog_feature().await?;

        let src = &self.info.src;
        if !self.src_ops.check_database_exists().await? {
            return Err(SyncError::normal(format!(
                "src database {} not exists",
                src.database
            )));
        }
        if self.info.sync_type == SyncType::DbSync
            && !self.src_ops.is_database_enable_binlog().await?
        {
            return Err(SyncError::normal(format!(
                "src database {} not enable binlog",
                src.database
            )));
        }
        self.info.src.db_id = self.src_meta.get_db_id().await?;

        if self.is_table_sync() {
            let src = &self.info.src;
            if !self.src_ops.check_table_exists().await? {
                return Err(SyncError::normal(format!(
                    "src table {}.{} not exists",
                    src.database, src.table
                )));
            }
            let invalid = self.src_ops.check_table_property_valid().await?;
            if !invalid.is_empty() {
                return Err(SyncError::normal(format!(
                    "src table {}.{} only support property: {}",
                    src.database,
                    src.table,
                    invalid.join(", ")
                )));
            }
            self.info.src.table_id = self.src_meta.get_table_id(&self.info.src.table).await?;
        }

        if !self.dest_ops.check_database_exists().await? {
            self.dest_ops.create_database().await?;
        }
        self.info.dest.db_id = self.dest_meta.get_db_id().await?;

        if self.is_table_sync()
            && !self.info.extra.allow_table_exists
            && self.dest_ops.check_table_exists().await?
        {
            return Err(SyncError::normal(format!(
                "dest table {}.{} already exists",
                self.info.dest.database, self.info.dest.table
            )));
        }
        Ok(())
    }

    /// Load the stored progress or start a new one with a full snapshot.
    async fn init_progress(&mut self) -> Result<()> {
        let attempts = self.ctx.sync.progress_load_attempts.max(1);
        let mut exists = None;
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.ctx.store.is_progress_exist(&self.info.name).await {
                Ok(found) => {
                    exists = Some(found);
                    break;
                }
                Err(err) => {
                    error!(job = %self.name(), attempt, error = %err, "Check job progress failed");
                    last_err = Some(err);
                }
            }
        }
        let exists = match (exists, last_err) {
            (Some(found), _) => found,
            (None, Some(err)) => return Err(err),
            (None, None) => return Err(SyncError::normal("check job progress failed")),
        };

        if exists {
            self.progress = JobProgress::load(&self.info.name, self.ctx.persister(), attempts).await?;
        } else {
            self.progress = JobProgress::new(&self.info.name, self.info.sync_type, self.ctx.persister());
            let info = format!(
                "new job, job: {}, sync type: {}",
                self.info.name, self.info.sync_type
            );
            self.new_snapshot(0, &info).await?;
        }

        if self.info.sync_type == SyncType::DbSync {
            self.src_meta.clear_tables_cache();
            self.dest_meta.clear_tables_cache();
        }
        Ok(())
    }

    /// One tick: settle a requested skip, then step the current phase.
    async fn sync(&mut self) -> Result<()> {
        if self.info.extra.skip_binlog {
            let satisfied = match self.info.extra.skip_by {
                Some(SkipBy::Silence) => {
                    self.info.extra.skip_commit_seq <= self.progress.prev_commit_seq
                }
                Some(SkipBy::FullSync) => self.progress.sync_state.is_full_sync(),
                None => false,
            };
            if satisfied {
                info!(
                    job = %self.name(),
                    commit_seq = self.info.extra.skip_commit_seq,
                    "Skip binlog finished"
                );
                self.info.extra.skip_binlog = false;
                self.persist_job().await?;
            }
        }

        match (self.info.sync_type, self.progress.sync_state) {
            (SyncType::TableSync, SyncState::TableFullSync) => self.full_sync().await,
            (SyncType::TableSync, SyncState::TableIncrementalSync) => self.incremental_sync().await,
            (SyncType::TableSync, SyncState::TablePartialSync) => self.partial_sync().await,
            (SyncType::DbSync, SyncState::DbFullSync) => self.full_sync().await,
            (
                SyncType::DbSync,
                SyncState::DbTablesIncrementalSync | SyncState::DbIncrementalSync,
            ) => self.incremental_sync().await,
            (SyncType::DbSync, SyncState::DbSpecificTableFullSync) => Ok(()),
            (SyncType::DbSync, SyncState::DbPartialSync) => self.partial_sync().await,
            (sync_type, state) => Err(SyncError::normal(format!(
                "unknown sync state {state} of {sync_type} job"
            ))
            .into_panic()),
        }
    }

    /// Record a failed tick. Meta errors start over with a full snapshot;
    /// panic errors latch the job.
    async fn handle_error(&mut self, err: &SyncError) {
        telemetry::record_job_error(&self.info.name, err.kind());
        if err.is_panic() {
            error!(job = %self.name(), error = %err, "Job panic");
            self.panic_error = Some(err.to_string());
            return;
        }

        if err.is_meta() {
            let info = format!(
                "receive meta category error, make new snapshot, job: {}, err: {err}",
                self.info.name
            );
            warn!(job = %self.name(), "{info}");
            let commit_seq = self.progress.commit_seq;
            if let Err(err) = self.new_snapshot(commit_seq, &info).await {
                error!(job = %self.name(), error = %err, "Make new snapshot failed");
            }
        }
    }

    /// Restart the job with a full snapshot anchored at `commit_seq`.
    async fn new_snapshot(&mut self, commit_seq: i64, full_sync_info: &str) -> Result<()> {
        info!(job = %self.name(), commit_seq, reason = full_sync_info, "New snapshot");
        if !full_sync_info.is_empty() {
            self.progress.set_full_sync_info(full_sync_info);
        }

        self.progress.partial_sync_data = None;
        self.progress.table_aliases.clear();
        self.progress.sync_id += 1;
        let state = match self.info.sync_type {
            SyncType::DbSync => SyncState::DbFullSync,
            SyncType::TableSync => SyncState::TableFullSync,
        };
        self.progress
            .next_with_persist(commit_seq, state, SubSyncState::BeginCreateSnapshot, String::new())
            .await;
        Ok(())
    }

    /// Start a partial snapshot of one table or some of its partitions.
    /// With `replace`, the table is restored under an alias and swapped in.
    async fn new_partial_snapshot(
        &mut self,
        table_id: i64,
        table: &str,
        partitions: Vec<String>,
        replace: bool,
    ) -> Result<()> {
        if self.is_table_sync() && table != self.info.src.table {
            return Err(SyncError::normal(format!(
                "partial sync table name is not equals to the source name {}, table: {table}, sync type: {}",
                self.info.src.table, self.info.sync_type
            )));
        }
        if replace && !partitions.is_empty() {
            return Err(SyncError::normal(format!(
                "partial sync with replace but partitions is not empty, table: {table}, len: {}",
                partitions.len()
            )));
        }

        let commit_seq = self.progress.commit_seq;
        info!(
            job = %self.name(),
            table_id,
            table,
            partitions = ?partitions,
            replace,
            commit_seq,
            "New partial snapshot"
        );

        self.progress.partial_sync_data = Some(crate::progress::PartialSyncData {
            table_id,
            table: table.to_string(),
            partition_ids: Vec::new(),
            partitions,
        });
        self.progress.table_aliases.clear();
        self.progress.sync_id += 1;
        if replace {
            self.progress
                .table_aliases
                .insert(table.to_string(), label::table_alias(table));
        }
        let state = match self.info.sync_type {
            SyncType::DbSync => SyncState::DbPartialSync,
            SyncType::TableSync => SyncState::TablePartialSync,
        };
        self.progress
            .next_with_persist(commit_seq, state, SubSyncState::BeginCreateSnapshot, String::new())
            .await;
        Ok(())
    }

    async fn desync(&mut self) -> Result<()> {
        let tables: Vec<String> = match self.info.sync_type {
            SyncType::DbSync => self
                .dest_meta
                .get_tables()
                .await?
                .into_values()
                .map(|table| table.name)
                .collect(),
            SyncType::TableSync => {
                let name = self
                    .dest_meta
                    .get_table_name_by_id(self.info.dest.table_id)
                    .await?;
                vec![name]
            }
        };
        info!(job = %self.name(), tables = ?tables, "Desync tables");
        self.dest_ops.desync_tables(&tables).await
    }
}

//! # Job Progress
//!
//! The durable cursor of a job. A progress records the high-level
//! [`SyncState`], the [`SubSyncState`] inside it, and the commit-sequence
//! watermark as a confirmed value (`prev_commit_seq`) plus an in-flight value
//! (`commit_seq`). The sub-state is `Done` exactly when both are equal.
//!
//! Every durable transition writes the whole progress as JSON through a
//! [`ProgressPersister`], which retries until the store accepts the write.
//! Scratch data for the current step lives in [`Scratch`]; only the
//! checkpoint payload in `persist_data` survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::error::{Result, SyncError};
use crate::job::SyncType;
use crate::record::TableRecord;
use crate::rpc::{BinlogType, SnapshotResult, SubTxnInfo, TabletCommitInfo};
use crate::storage::JobStore;
use crate::telemetry;

/// High-level phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum SyncState {
    DbFullSync,
    /// Catching up per table after a full sync, before a common watermark exists.
    DbTablesIncrementalSync,
    /// Superseded by `DbPartialSync`; kept so old progress still loads.
    DbSpecificTableFullSync,
    DbIncrementalSync,
    DbPartialSync,
    TableFullSync,
    TableIncrementalSync,
    TablePartialSync,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::DbFullSync => "DBFullSync",
            SyncState::DbTablesIncrementalSync => "DBTablesIncrementalSync",
            SyncState::DbSpecificTableFullSync => "DBSpecificTableFullSync",
            SyncState::DbIncrementalSync => "DBIncrementalSync",
            SyncState::DbPartialSync => "DBPartialSync",
            SyncState::TableFullSync => "TableFullSync",
            SyncState::TableIncrementalSync => "TableIncrementalSync",
            SyncState::TablePartialSync => "TablePartialSync",
        }
    }

    pub fn is_full_sync(&self) -> bool {
        matches!(self, SyncState::DbFullSync | SyncState::TableFullSync)
    }

    pub fn is_incremental(&self) -> bool {
        matches!(
            self,
            SyncState::DbTablesIncrementalSync
                | SyncState::DbIncrementalSync
                | SyncState::TableIncrementalSync
        )
    }
}

impl From<SyncState> for i32 {
    fn from(state: SyncState) -> Self {
        match state {
            SyncState::DbFullSync => 0,
            SyncState::DbTablesIncrementalSync => 1,
            SyncState::DbSpecificTableFullSync => 2,
            SyncState::DbIncrementalSync => 3,
            SyncState::DbPartialSync => 4,
            SyncState::TableFullSync => 500,
            SyncState::TableIncrementalSync => 501,
            SyncState::TablePartialSync => 502,
        }
    }
}

impl TryFrom<i32> for SyncState {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => SyncState::DbFullSync,
            1 => SyncState::DbTablesIncrementalSync,
            2 => SyncState::DbSpecificTableFullSync,
            3 => SyncState::DbIncrementalSync,
            4 => SyncState::DbPartialSync,
            500 => SyncState::TableFullSync,
            501 => SyncState::TableIncrementalSync,
            502 => SyncState::TablePartialSync,
            other => return Err(format!("unknown sync state: {other}")),
        })
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step inside a phase. Transaction steps belong to the upsert changelog type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SubSyncWire", into = "SubSyncWire")]
pub enum SubSyncState {
    Done,
    BeginCreateSnapshot,
    GetSnapshotInfo,
    AddExtraInfo,
    RestoreSnapshot,
    PersistRestoreInfo,
    WaitBackupDone,
    WaitRestoreDone,
    BeginTransaction,
    IngestBinlog,
    CommitTransaction,
    RollbackTransaction,
}

#[derive(Serialize, Deserialize)]
struct SubSyncWire {
    state: i32,
    binlog_type: i64,
}

impl SubSyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubSyncState::Done => "Done",
            SubSyncState::BeginCreateSnapshot => "BeginCreateSnapshot",
            SubSyncState::GetSnapshotInfo => "GetSnapshotInfo",
            SubSyncState::AddExtraInfo => "AddExtraInfo",
            SubSyncState::RestoreSnapshot => "RestoreSnapshot",
            SubSyncState::PersistRestoreInfo => "PersistRestoreInfo",
            SubSyncState::WaitBackupDone => "WaitBackupDone",
            SubSyncState::WaitRestoreDone => "WaitRestoreDone",
            SubSyncState::BeginTransaction => "BeginTransaction",
            SubSyncState::IngestBinlog => "IngestBinlog",
            SubSyncState::CommitTransaction => "CommitTransaction",
            SubSyncState::RollbackTransaction => "RollbackTransaction",
        }
    }

    /// Changelog type whose handler owns this step, if any.
    pub fn binlog_type(&self) -> Option<BinlogType> {
        match self {
            SubSyncState::BeginTransaction
            | SubSyncState::IngestBinlog
            | SubSyncState::CommitTransaction
            | SubSyncState::RollbackTransaction => Some(BinlogType::Upsert),
            _ => None,
        }
    }

    fn state_code(&self) -> i32 {
        match self {
            SubSyncState::Done => -1,
            SubSyncState::BeginCreateSnapshot => 0,
            SubSyncState::GetSnapshotInfo => 1,
            SubSyncState::AddExtraInfo => 2,
            SubSyncState::RestoreSnapshot => 3,
            SubSyncState::PersistRestoreInfo => 4,
            SubSyncState::WaitBackupDone => 5,
            SubSyncState::WaitRestoreDone => 6,
            SubSyncState::BeginTransaction => 11,
            SubSyncState::IngestBinlog => 12,
            SubSyncState::CommitTransaction => 13,
            SubSyncState::RollbackTransaction => 14,
        }
    }
}

impl From<SubSyncState> for SubSyncWire {
    fn from(state: SubSyncState) -> Self {
        SubSyncWire {
            state: state.state_code(),
            binlog_type: state.binlog_type().map(BinlogType::to_wire).unwrap_or(-1),
        }
    }
}

impl TryFrom<SubSyncWire> for SubSyncState {
    type Error = String;

    fn try_from(wire: SubSyncWire) -> std::result::Result<Self, Self::Error> {
        Ok(match wire.state {
            -1 => SubSyncState::Done,
            0 => SubSyncState::BeginCreateSnapshot,
            1 => SubSyncState::GetSnapshotInfo,
            2 => SubSyncState::AddExtraInfo,
            3 => SubSyncState::RestoreSnapshot,
            4 => SubSyncState::PersistRestoreInfo,
            5 => SubSyncState::WaitBackupDone,
            6 => SubSyncState::WaitRestoreDone,
            11 => SubSyncState::BeginTransaction,
            12 => SubSyncState::IngestBinlog,
            13 => SubSyncState::CommitTransaction,
            14 => SubSyncState::RollbackTransaction,
            other => {
                return Err(format!(
                    "unknown sub sync state: {other}, binlog type: {}",
                    wire.binlog_type
                ));
            }
        })
    }
}

impl fmt::Display for SubSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target of a partial snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSyncData {
    pub table_id: i64,
    pub table: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub partition_ids: Vec<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub partitions: Vec<String>,
}

/// Why and where the last full sync was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSyncInfo {
    pub prev_commit_seq: i64,
    pub commit_seq: i64,
    pub sub_sync_state: SubSyncState,
    pub info: String,
}

impl Default for FullSyncInfo {
    fn default() -> Self {
        Self {
            prev_commit_seq: 0,
            commit_seq: 0,
            sub_sync_state: SubSyncState::Done,
            info: String::new(),
        }
    }
}

/// Working set of the snapshot step machine between `GetSnapshotInfo` and
/// `WaitRestoreDone`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotScratch {
    pub snapshot_name: String,
    pub snapshot_resp: SnapshotResult,
    #[serde(default)]
    pub table_commit_seq_map: HashMap<i64, i64>,
    #[serde(default)]
    pub table_name_mapping: HashMap<i64, String>,
    #[serde(default)]
    pub views: Vec<String>,
    #[serde(default)]
    pub restore_label: String,
}

/// Working set of the upsert transaction protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertScratch {
    pub commit_seq: i64,
    pub txn_id: i64,
    #[serde(default)]
    pub dest_table_ids: Vec<i64>,
    #[serde(default)]
    pub table_records: Vec<TableRecord>,
    #[serde(default)]
    pub commit_infos: Vec<TabletCommitInfo>,
    #[serde(default)]
    pub is_txn_insert: bool,
    #[serde(default)]
    pub source_stids: Vec<i64>,
    #[serde(default)]
    pub dest_stids: Vec<i64>,
    #[serde(default)]
    pub sub_txn_infos: Vec<SubTxnInfo>,
    #[serde(default)]
    pub label: String,
}

/// In-memory data of the current step, one variant per kind of step.
#[derive(Debug, Clone)]
pub enum Scratch {
    /// `WaitBackupDone` only needs the backup label.
    SnapshotName(String),
    Snapshot(Box<SnapshotScratch>),
    Upsert(Box<UpsertScratch>),
}

/// Writes progress blobs, retrying until the store accepts them.
#[derive(Clone)]
pub struct ProgressPersister {
    store: Arc<dyn JobStore>,
    retry_delay: Duration,
}

impl ProgressPersister {
    pub fn new(store: Arc<dyn JobStore>, retry_delay: Duration) -> Self {
        Self { store, retry_delay }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    async fn write(&self, progress: &JobProgress) {
        loop {
            let blob = match serde_json::to_string(progress) {
                Ok(blob) => blob,
                Err(err) => {
                    error!(job = %progress.job_name, error = %err, "Failed to encode job progress");
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
            };

            match self.store.update_progress(&progress.job_name, &blob).await {
                Ok(()) => break,
                Err(err) => {
                    error!(job = %progress.job_name, error = %err, "Failed to update job progress");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}

impl fmt::Debug for ProgressPersister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressPersister")
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

/// Durable state-machine cursor of one job.
#[derive(Serialize, Deserialize)]
pub struct JobProgress {
    pub job_name: String,
    pub sync_state: SyncState,
    pub sub_sync_state: SubSyncState,
    /// Bumped for every new full or partial snapshot; part of snapshot labels.
    #[serde(rename = "job_sync_id")]
    pub sync_id: i64,
    /// Confirmed watermark.
    pub prev_commit_seq: i64,
    /// In-flight watermark.
    pub commit_seq: i64,
    /// Last commit seq a handler started on.
    #[serde(default)]
    pub last_commit_seq: i64,
    /// Source table id to destination table id, database scope only.
    #[serde(default, deserialize_with = "null_as_default")]
    pub table_mapping: HashMap<i64, i64>,
    /// Source table id to name as of the last snapshot; may be stale after renames.
    #[serde(default, skip_serializing_if = "HashMap::is_empty", deserialize_with = "null_as_default")]
    pub table_name_mapping: HashMap<i64, String>,
    /// Per-table watermark, present only while bootstrapping after a full sync.
    #[serde(default)]
    pub table_commit_seq_map: Option<HashMap<i64, i64>>,
    #[serde(rename = "data", default)]
    pub persist_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_sync_data: Option<PartialSyncData>,
    /// Tables restored under an alias, to be swapped in after the restore.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "null_as_default")]
    pub table_aliases: BTreeMap<String, String>,
    /// Shadow index id to origin index id of pending schema changes.
    #[serde(
        rename = "shadow_index_map",
        default,
        skip_serializing_if = "HashMap::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub shadow_indexes: HashMap<i64, i64>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub full_sync_start_at: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub partial_sync_start_at: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub incremental_sync_start_at: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ingest_binlog_at: i64,
    #[serde(default)]
    pub full_sync_info: FullSyncInfo,

    #[serde(skip)]
    pub in_memory: Option<Scratch>,
    #[serde(skip)]
    persister: Option<ProgressPersister>,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl JobProgress {
    /// Fresh progress: full sync, about to create the first snapshot.
    pub fn new(job_name: &str, sync_type: SyncType, persister: ProgressPersister) -> Self {
        let sync_state = match sync_type {
            SyncType::DbSync => SyncState::DbFullSync,
            SyncType::TableSync => SyncState::TableFullSync,
        };
        let now = now_secs();
        Self {
            job_name: job_name.to_string(),
            sync_state,
            sub_sync_state: SubSyncState::BeginCreateSnapshot,
            sync_id: now,
            prev_commit_seq: 0,
            commit_seq: 0,
            last_commit_seq: 0,
            table_mapping: HashMap::new(),
            table_name_mapping: HashMap::new(),
            table_commit_seq_map: None,
            persist_data: String::new(),
            partial_sync_data: None,
            table_aliases: BTreeMap::new(),
            shadow_indexes: HashMap::new(),
            created_at: now,
            full_sync_start_at: 0,
            partial_sync_start_at: 0,
            incremental_sync_start_at: 0,
            ingest_binlog_at: 0,
            full_sync_info: FullSyncInfo::default(),
            in_memory: None,
            persister: Some(persister),
        }
    }

    /// Decode a stored blob. Scratch data is always dropped.
    pub fn from_json(data: &str, persister: ProgressPersister) -> Result<Self> {
        let mut progress: JobProgress = serde_json::from_str(data).map_err(|e| {
            SyncError::wrap(crate::error::ErrorKind::Normal, "unmarshal job progress failed", e)
        })?;
        progress.in_memory = None;
        progress.persister = Some(persister);
        Ok(progress)
    }

    /// Load the stored progress of a job, retrying the read `attempts` times.
    pub async fn load(job_name: &str, persister: ProgressPersister, attempts: u32) -> Result<Self> {
        let mut last_err = None;
        for attempt in 1..=attempts.max(1) {
            match persister.store.get_progress(job_name).await {
                Ok(Some(blob)) => return Self::from_json(&blob, persister),
                Ok(None) => {
                    return Err(SyncError::normal(format!("progress of job {job_name} not found")));
                }
                Err(err) => {
                    error!(job = %job_name, attempt, error = %err, "Failed to get job progress");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SyncError::normal("get job progress failed")))
    }

    /// Source table id currently known under `name`.
    pub fn get_table_id(&self, name: &str) -> Option<i64> {
        self.table_name_mapping
            .iter()
            .find(|(_, table)| table.as_str() == name)
            .map(|(id, _)| *id)
    }

    pub fn is_done(&self) -> bool {
        self.sub_sync_state == SubSyncState::Done && self.prev_commit_seq == self.commit_seq
    }

    /// Start handling the changelog entry at `commit_seq`.
    pub async fn start_handle(&mut self, commit_seq: i64) {
        self.commit_seq = commit_seq;
        self.last_commit_seq = commit_seq;
        self.persist().await;
    }

    /// Advance without persisting. A crash here resumes from the last checkpoint.
    pub fn next_sub_volatile(&mut self, sub_sync_state: SubSyncState, scratch: Option<Scratch>) {
        self.sub_sync_state = sub_sync_state;
        self.in_memory = scratch;
    }

    /// Advance and persist `persist_data` as the resume anchor of the new step.
    pub async fn next_sub_checkpoint(&mut self, sub_sync_state: SubSyncState, persist_data: String) {
        if sub_sync_state == SubSyncState::IngestBinlog {
            self.ingest_binlog_at = now_secs();
        }
        self.sub_sync_state = sub_sync_state;
        self.persist_data = persist_data;
        self.persist().await;
    }

    pub async fn commit_next_sub_with_persist(
        &mut self,
        commit_seq: i64,
        sub_sync_state: SubSyncState,
        persist_data: String,
    ) {
        self.commit_seq = commit_seq;
        self.sub_sync_state = sub_sync_state;
        self.persist_data = persist_data;
        self.persist().await;
    }

    /// Switch phase. Reaching `Done` also confirms the watermark.
    pub async fn next_with_persist(
        &mut self,
        commit_seq: i64,
        sync_state: SyncState,
        sub_sync_state: SubSyncState,
        persist_data: String,
    ) {
        let now = now_secs();
        match (sub_sync_state, sync_state) {
            (SubSyncState::BeginCreateSnapshot, SyncState::TableFullSync | SyncState::DbFullSync) => {
                self.full_sync_start_at = now;
                self.incremental_sync_start_at = 0;
                self.ingest_binlog_at = 0;
            }
            (
                SubSyncState::BeginCreateSnapshot,
                SyncState::TablePartialSync | SyncState::DbPartialSync,
            ) => {
                self.partial_sync_start_at = now;
                self.incremental_sync_start_at = 0;
                self.ingest_binlog_at = 0;
            }
            (SubSyncState::Done, SyncState::TableIncrementalSync | SyncState::DbIncrementalSync) => {
                self.incremental_sync_start_at = now;
                self.ingest_binlog_at = 0;
            }
            _ => {}
        }

        self.commit_seq = commit_seq;
        if sub_sync_state == SubSyncState::Done {
            self.prev_commit_seq = commit_seq;
        }
        self.sync_state = sync_state;
        self.sub_sync_state = sub_sync_state;
        self.persist_data = persist_data;
        self.in_memory = None;
        self.persist().await;
    }

    /// Close the cycle and confirm the in-flight watermark.
    pub async fn done(&mut self) {
        debug!(
            job = %self.job_name,
            sync_state = %self.sync_state,
            commit_seq = self.commit_seq,
            prev_commit_seq = self.prev_commit_seq,
            "Job step done"
        );
        self.sub_sync_state = SubSyncState::Done;
        self.prev_commit_seq = self.commit_seq;
        telemetry::record_commit_seq(&self.job_name, self.prev_commit_seq);
        self.persist().await;
    }

    /// Drop the in-flight watermark and return to the confirmed one.
    pub async fn rollback(&mut self) {
        info!(
            job = %self.job_name,
            from = self.commit_seq,
            to = self.prev_commit_seq,
            "Rollback progress"
        );
        self.sub_sync_state = SubSyncState::Done;
        self.commit_seq = self.prev_commit_seq;
        self.persist().await;
    }

    pub fn set_full_sync_info(&mut self, info: &str) {
        self.full_sync_info = FullSyncInfo {
            prev_commit_seq: self.prev_commit_seq,
            commit_seq: self.commit_seq,
            sub_sync_state: self.sub_sync_state,
            info: info.to_string(),
        };
    }

    /// Write the progress, blocking until the store accepts it.
    pub async fn persist(&self) {
        trace!(
            job = %self.job_name,
            sync_state = %self.sync_state,
            sub_sync_state = %self.sub_sync_state,
            commit_seq = self.commit_seq,
            prev_commit_seq = self.prev_commit_seq,
            "Update job progress"
        );
        match &self.persister {
            Some(persister) => persister.write(self).await,
            None => error!(job = %self.job_name, "Job progress has no persister attached"),
        }
    }
}

impl fmt::Debug for JobProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobProgress")
            .field("job_name", &self.job_name)
            .field("sync_state", &self.sync_state)
            .field("sub_sync_state", &self.sub_sync_state)
            .field("commit_seq", &self.commit_seq)
            .field("prev_commit_seq", &self.prev_commit_seq)
            .field("table_commit_seq_map", &self.table_commit_seq_map)
            .finish_non_exhaustive()
    }
}

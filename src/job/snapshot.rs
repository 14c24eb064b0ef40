//! Full and partial sync: backup on the source, restore on the destination.
//!
//! Both protocols walk the same steps:
//!
//! 1. `BeginCreateSnapshot`: start (or reuse) a backup job.
//! 2. `WaitBackupDone`: poll until the backup finishes, then checkpoint its name.
//! 3. `GetSnapshotInfo`: fetch the snapshot and read its job info.
//! 4. `AddExtraInfo`: inject the source topology the destination needs to pull data.
//! 5. `RestoreSnapshot`: start (or reuse) a restore job.
//! 6. `WaitRestoreDone`: poll until the restore finishes.
//! 7. `PersistRestoreInfo`: swap aliased tables in, rebuild the table mapping
//!    and switch to incremental sync.
//!
//! Steps 3 to 6 share a [`SnapshotScratch`] kept in memory only; a restart
//! resumes from the last checkpoint (`GetSnapshotInfo` or
//! `PersistRestoreInfo`).

use std::collections::{BTreeSet, HashMap};
use std::io::Read;

use flate2::read::GzDecoder;
use serde_json::{Map, Value, json};
use tracing::{debug, info, trace, warn};

use super::{JobCore, SyncType, label};
use crate::cluster::{BackupOutcome, RestoreProgress};
use crate::error::{ErrorKind, Result, SyncError};
use crate::meta::MetaSnapshot;
use crate::progress::{Scratch, SnapshotScratch, SubSyncState, SyncState};
use crate::record::{BackupJobInfo, TableType};
use crate::rpc::{RestoreSnapshotRequest, SnapshotResult, StatusCode, TableRef};

/// Whether a step machine keeps going within this tick.
enum Flow {
    Continue,
    Yield,
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Replace compressed blobs by their plain form.
fn decompress_snapshot(resp: &mut SnapshotResult) -> Result<()> {
    if !resp.compressed {
        return Ok(());
    }
    resp.job_info = gunzip(&resp.job_info).map_err(|e| {
        SyncError::wrap(ErrorKind::Normal, "decompress snapshot job info failed", e)
    })?;
    resp.meta = gunzip(&resp.meta)
        .map_err(|e| SyncError::wrap(ErrorKind::Normal, "decompress snapshot meta failed", e))?;
    resp.compressed = false;
    Ok(())
}

fn is_expired(expired_at: i64) -> bool {
    expired_at > 0 && chrono::Utc::now().timestamp_millis() > expired_at
}

/// Lowest table watermark of a database snapshot; views carry zero and are ignored.
fn min_commit_seq(table_commit_seq_map: &HashMap<i64, i64>, snapshot_commit_seq: i64) -> Option<i64> {
    table_commit_seq_map
        .values()
        .copied()
        .filter(|seq| *seq != 0)
        .chain((snapshot_commit_seq > 0).then_some(snapshot_commit_seq))
        .min()
}

impl JobCore {
    pub(super) async fn full_sync(&mut self) -> Result<()> {
        while let Flow::Continue = self.full_sync_step().await? {}
        Ok(())
    }

    pub(super) async fn partial_sync(&mut self) -> Result<()> {
        while let Flow::Continue = self.partial_sync_step().await? {}
        Ok(())
    }

    async fn full_sync_step(&mut self) -> Result<Flow> {
        let sub_sync_state = self.progress.sub_sync_state;
        match sub_sync_state {
            SubSyncState::Done => {
                info!(job = %self.name(), "Full sync status: done");
                let commit_seq = self.progress.commit_seq;
                self.new_snapshot(commit_seq, "").await?;
                Ok(Flow::Continue)
            }
            SubSyncState::BeginCreateSnapshot => self.begin_full_snapshot().await,
            SubSyncState::WaitBackupDone => self.wait_backup_done().await,
            SubSyncState::GetSnapshotInfo => self.full_snapshot_info().await,
            SubSyncState::AddExtraInfo
            | SubSyncState::RestoreSnapshot
            | SubSyncState::WaitRestoreDone => {
                let Some(mut scratch) = self.take_snapshot_scratch() else {
                    return Ok(self.snapshot_scratch_lost());
                };
                let result = match sub_sync_state {
                    SubSyncState::AddExtraInfo => self.add_extra_info_step(&mut scratch).await,
                    SubSyncState::RestoreSnapshot => self.full_restore(&mut scratch).await,
                    _ => self.full_wait_restore_done(&mut scratch).await,
                };
                self.reattach_snapshot_scratch(scratch);
                result
            }
            SubSyncState::PersistRestoreInfo => self.full_persist_restore_info().await,
            other => Err(SyncError::normal(format!(
                "invalid job sub sync state {other}"
            ))),
        }
    }

    async fn partial_sync_step(&mut self) -> Result<Flow> {
        if self.progress.partial_sync_data.is_none() {
            return Err(SyncError::normal("run partial sync but data is nil"));
        }

        let sub_sync_state = self.progress.sub_sync_state;
        match sub_sync_state {
            SubSyncState::Done => {
                info!(job = %self.name(), "Partial sync status: done");
                let (table_id, table, partitions) = self.partial_target();
                let replace = !self.progress.table_aliases.is_empty();
                self.new_partial_snapshot(table_id, &table, partitions, replace)
                    .await?;
                Ok(Flow::Continue)
            }
            SubSyncState::BeginCreateSnapshot => self.begin_partial_snapshot().await,
            SubSyncState::WaitBackupDone => self.wait_backup_done().await,
            SubSyncState::GetSnapshotInfo => self.partial_snapshot_info().await,
            SubSyncState::AddExtraInfo
            | SubSyncState::RestoreSnapshot
            | SubSyncState::WaitRestoreDone => {
                let Some(mut scratch) = self.take_snapshot_scratch() else {
                    return Ok(self.snapshot_scratch_lost());
                };
                let result = match sub_sync_state {
                    SubSyncState::AddExtraInfo => self.add_extra_info_step(&mut scratch).await,
                    SubSyncState::RestoreSnapshot => self.partial_restore(&mut scratch).await,
                    _ => self.partial_wait_restore_done(&mut scratch).await,
                };
                self.reattach_snapshot_scratch(scratch);
                result
            }
            SubSyncState::PersistRestoreInfo => self.partial_persist_restore_info().await,
            other => Err(SyncError::normal(format!(
                "invalid job sub sync state {other}"
            ))),
        }
    }

    fn partial_target(&self) -> (i64, String, Vec<String>) {
        match &self.progress.partial_sync_data {
            Some(data) => (data.table_id, data.table.clone(), data.partitions.clone()),
            None => (0, String::new(), Vec::new()),
        }
    }

    /// The scratch of steps 3 to 6, from memory or from the last checkpoint.
    fn take_snapshot_scratch(&mut self) -> Option<Box<SnapshotScratch>> {
        match self.progress.in_memory.take() {
            Some(Scratch::Snapshot(scratch)) => Some(scratch),
            other => {
                self.progress.in_memory = other;
                serde_json::from_str::<SnapshotScratch>(&self.progress.persist_data)
                    .ok()
                    .map(Box::new)
            }
        }
    }

    /// Keep the scratch for the next step unless the step left the protocol.
    fn reattach_snapshot_scratch(&mut self, scratch: Box<SnapshotScratch>) {
        let needs_scratch = matches!(
            self.progress.sub_sync_state,
            SubSyncState::AddExtraInfo | SubSyncState::RestoreSnapshot | SubSyncState::WaitRestoreDone
        );
        if needs_scratch && self.progress.in_memory.is_none() {
            self.progress.in_memory = Some(Scratch::Snapshot(scratch));
        }
    }

    fn snapshot_scratch_lost(&mut self) -> Flow {
        warn!(
            job = %self.name(),
            sub_sync_state = %self.progress.sub_sync_state,
            "Snapshot data is lost, fetch the snapshot again"
        );
        self.progress
            .next_sub_volatile(SubSyncState::GetSnapshotInfo, None);
        Flow::Continue
    }

    async fn begin_full_snapshot(&mut self) -> Result<Flow> {
        let prefix = label::snapshot_prefix(&self.info.name, self.progress.sync_id);
        info!(job = %self.name(), prefix = %prefix, "Full sync status: create snapshot");

        if self.reuse_backup_job(&prefix).await? {
            return Ok(Flow::Yield);
        }

        let tables = match self.info.sync_type {
            SyncType::DbSync => {
                let tables = self.src_meta.get_tables().await?;
                let backupable = tables
                    .values()
                    .filter(|table| matches!(table.table_type, TableType::Olap | TableType::View))
                    .count();
                if backupable == 0 {
                    warn!(job = %self.name(), "Full sync but source db is empty, retry later");
                    return Ok(Flow::Yield);
                }
                Vec::new()
            }
            SyncType::TableSync => vec![self.info.src.table.clone()],
        };

        let snapshot_name = label::with_timestamp(&prefix);
        info!(job = %self.name(), snapshot = %snapshot_name, "Full sync status: create snapshot");
        self.src_ops.create_snapshot(&snapshot_name, &tables).await?;
        self.progress.next_sub_volatile(
            SubSyncState::WaitBackupDone,
            Some(Scratch::SnapshotName(snapshot_name)),
        );
        Ok(Flow::Yield)
    }

    async fn begin_partial_snapshot(&mut self) -> Result<Flow> {
        let (table_id, table, partitions) = self.partial_target();
        let prefix = label::partial_snapshot_prefix(&self.info.name, self.progress.sync_id);
        info!(job = %self.name(), prefix = %prefix, "Partial sync status: create snapshot");

        if self.reuse_backup_job(&prefix).await? {
            return Ok(Flow::Yield);
        }

        let snapshot_name = label::with_timestamp(&prefix);
        info!(
            job = %self.name(),
            snapshot = %snapshot_name,
            table = %table,
            partitions = ?partitions,
            "Partial sync status: create snapshot"
        );
        match self
            .src_ops
            .create_partial_snapshot(&snapshot_name, &table, &partitions)
            .await?
        {
            BackupOutcome::Created => {
                self.progress.next_sub_volatile(
                    SubSyncState::WaitBackupDone,
                    Some(Scratch::SnapshotName(snapshot_name)),
                );
                Ok(Flow::Yield)
            }
            BackupOutcome::PartitionNotFound => {
                warn!(
                    job = %self.name(),
                    table = %table,
                    "Partition not found in the upstream, step to table partial sync"
                );
                self.new_partial_snapshot(table_id, &table, Vec::new(), true)
                    .await?;
                Ok(Flow::Continue)
            }
            BackupOutcome::TableNotFound => {
                self.handle_partial_sync_table_not_found().await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Adopt a backup left running by a previous process.
    async fn reuse_backup_job(&mut self, prefix: &str) -> Result<bool> {
        if !self.features().reuse_running_backup_restore_job {
            return Ok(false);
        }
        let Some(snapshot_name) = self.src_ops.get_valid_backup_job(prefix).await? else {
            return Ok(false);
        };
        info!(job = %self.name(), snapshot = %snapshot_name, "Reuse the existing backup job");
        self.progress.next_sub_volatile(
            SubSyncState::WaitBackupDone,
            Some(Scratch::SnapshotName(snapshot_name)),
        );
        Ok(true)
    }

    async fn wait_backup_done(&mut self) -> Result<Flow> {
        let snapshot_name = match &self.progress.in_memory {
            Some(Scratch::SnapshotName(name)) => name.clone(),
            _ => {
                warn!(job = %self.name(), "Backup name is lost, create the snapshot again");
                self.progress
                    .next_sub_volatile(SubSyncState::BeginCreateSnapshot, None);
                return Ok(Flow::Continue);
            }
        };

        match self.src_ops.check_backup_finished(&snapshot_name).await {
            Err(err) => {
                self.progress.next_sub_volatile(
                    SubSyncState::BeginCreateSnapshot,
                    Some(Scratch::SnapshotName(snapshot_name)),
                );
                Err(err)
            }
            Ok(false) => Ok(Flow::Yield),
            Ok(true) => {
                self.progress
                    .next_sub_checkpoint(SubSyncState::GetSnapshotInfo, snapshot_name)
                    .await;
                Ok(Flow::Continue)
            }
        }
    }

    /// Fetch the checkpointed snapshot. `None` means it vanished and the
    /// caller must start over.
    async fn fetch_snapshot(&self, snapshot_name: &str) -> Result<Option<SnapshotResult>> {
        let src = &self.info.src;
        let src_rpc = self.ctx.factory.fe_rpc(src)?;
        trace!(job = %self.name(), snapshot = snapshot_name, "Begin get snapshot");
        let mut resp = src_rpc.get_snapshot(src, snapshot_name, false).await?;

        match resp.status.code {
            StatusCode::Ok => {}
            StatusCode::SnapshotNotExist | StatusCode::SnapshotExpired => return Ok(None),
            _ => {
                return Err(SyncError::fe(format!(
                    "get snapshot failed, status: {}",
                    resp.status
                )));
            }
        }
        if resp.job_info.is_empty() {
            return Err(SyncError::normal("jobInfo of the snapshot resp is not set"));
        }
        decompress_snapshot(&mut resp)?;
        trace!(
            job = %self.name(),
            job_info = %String::from_utf8_lossy(&resp.job_info[..resp.job_info.len().min(128)]),
            "Snapshot job info"
        );
        Ok(Some(resp))
    }

    async fn full_snapshot_info(&mut self) -> Result<Flow> {
        info!(job = %self.name(), "Full sync status: get snapshot info");
        let snapshot_name = self.progress.persist_data.clone();
        let Some(resp) = self.fetch_snapshot(&snapshot_name).await? else {
            let info = format!("get snapshot {snapshot_name}: not exist or expired");
            warn!(job = %self.name(), "force full sync, because {info}");
            let commit_seq = self.progress.commit_seq;
            self.new_snapshot(commit_seq, &info).await?;
            return Ok(Flow::Continue);
        };

        let job_info = BackupJobInfo::from_json(&resp.job_info)?;
        let mut table_commit_seq_map = job_info.table_commit_seq_map.clone().unwrap_or_default();
        let mut table_name_mapping = job_info.table_name_mapping();
        let views = job_info.views();

        match self.info.sync_type {
            SyncType::TableSync => {
                let src_table = self.info.src.table.clone();
                let Some(object) = job_info.backup_objects.get(&src_table) else {
                    return Err(SyncError::normal(format!(
                        "table {src_table} not found in backup objects"
                    )));
                };
                if object.id != self.info.src.table_id {
                    let info = format!(
                        "full sync table {src_table} id not match, force full sync. table id {}, backup object id {}",
                        self.info.src.table_id, object.id
                    );
                    warn!(job = %self.name(), "{info}");
                    self.info.src.table_id = object.id;
                    self.persist_job().await?;
                    let commit_seq = self.progress.commit_seq;
                    self.new_snapshot(commit_seq, &info).await?;
                    return Ok(Flow::Continue);
                }
                if !table_commit_seq_map.contains_key(&object.id) {
                    return Err(SyncError::normal(format!(
                        "table id {}, commit seq not found",
                        object.id
                    )));
                }
            }
            SyncType::DbSync => {
                // Views are tracked under the snapshot's watermark so their mapping is built too.
                if let Some(objects) = &job_info.new_backup_objects {
                    for view in &objects.views {
                        table_name_mapping.insert(view.id, view.name.clone());
                        table_commit_seq_map.insert(view.id, resp.commit_seq);
                    }
                }
            }
        }
        debug!(
            job = %self.name(),
            table_commit_seq_map = ?table_commit_seq_map,
            table_name_mapping = ?table_name_mapping,
            "Full sync snapshot info"
        );

        let scratch = SnapshotScratch {
            snapshot_name,
            snapshot_resp: resp,
            table_commit_seq_map,
            table_name_mapping,
            views,
            restore_label: String::new(),
        };
        self.progress.next_sub_volatile(
            SubSyncState::AddExtraInfo,
            Some(Scratch::Snapshot(Box::new(scratch))),
        );
        Ok(Flow::Continue)
    }

    async fn partial_snapshot_info(&mut self) -> Result<Flow> {
        info!(job = %self.name(), "Partial sync status: get snapshot info");
        let (table_id, table, partitions) = self.partial_target();
        let snapshot_name = self.progress.persist_data.clone();
        let Some(resp) = self.fetch_snapshot(&snapshot_name).await? else {
            warn!(
                job = %self.name(),
                snapshot = %snapshot_name,
                "Force new partial sync, the snapshot does not exist or is expired"
            );
            let replace = !self.progress.table_aliases.is_empty();
            self.new_partial_snapshot(table_id, &table, partitions, replace)
                .await?;
            return Ok(Flow::Continue);
        };

        let job_info = BackupJobInfo::from_json(&resp.job_info)?;
        let table_commit_seq_map = job_info.table_commit_seq_map.clone().unwrap_or_default();
        let table_name_mapping = job_info.table_name_mapping();
        let Some(object) = job_info.backup_objects.get(&table) else {
            return Err(SyncError::normal(format!(
                "table {table} not found in backup objects"
            )));
        };
        if object.id != table_id {
            let mut info = format!(
                "partial sync table {table} id not match, force full sync. table id {table_id}, backup object id {}",
                object.id
            );
            warn!(job = %self.name(), "{info}");
            if self.is_table_sync() {
                info = format!(
                    "partial sync table {table} id not match, reset src table id from {} to {}, table {table}, force full sync",
                    self.info.src.table_id, object.id
                );
                info!(job = %self.name(), "{info}");
                self.info.src.table_id = object.id;
                self.persist_job().await?;
            }
            let commit_seq = self.progress.commit_seq;
            self.new_snapshot(commit_seq, &info).await?;
            return Ok(Flow::Continue);
        }
        if !table_commit_seq_map.contains_key(&object.id) {
            return Err(SyncError::normal(format!(
                "commit seq not found, table id {}, table name: {table}",
                object.id
            )));
        }

        let scratch = SnapshotScratch {
            snapshot_name,
            snapshot_resp: resp,
            table_commit_seq_map,
            table_name_mapping,
            views: Vec::new(),
            restore_label: String::new(),
        };
        self.progress.next_sub_volatile(
            SubSyncState::AddExtraInfo,
            Some(Scratch::Snapshot(Box::new(scratch))),
        );
        Ok(Flow::Continue)
    }

    async fn add_extra_info_step(&mut self, scratch: &mut SnapshotScratch) -> Result<Flow> {
        let resp = &scratch.snapshot_resp;
        info!(
            job = %self.name(),
            snapshot = %scratch.snapshot_name,
            meta_size = resp.meta.len(),
            job_info_size = resp.job_info.len(),
            expired_at = resp.expired_at,
            commit_seq = resp.commit_seq,
            "Add extra info to the snapshot"
        );

        let job_info = self.add_extra_info(&resp.job_info).await?;
        debug!(job = %self.name(), size = job_info.len(), "Snapshot job info with extra info");
        scratch.snapshot_resp.job_info = job_info;
        self.progress
            .next_sub_volatile(SubSyncState::RestoreSnapshot, None);
        Ok(Flow::Continue)
    }

    /// Add the source backends and master token under `extra_info`.
    async fn add_extra_info(&self, job_info: &[u8]) -> Result<Vec<u8>> {
        let mut object: Map<String, Value> = serde_json::from_slice(job_info).map_err(|e| {
            SyncError::wrap(
                ErrorKind::Normal,
                format!(
                    "unmarshal jobInfo failed, jobInfo: {}",
                    String::from_utf8_lossy(job_info)
                ),
                e,
            )
        })?;

        let token = self.src_meta.get_master_token().await?;
        let backends = self.src_meta.get_backends().await?;
        let be_network_map: Map<String, Value> = backends
            .iter()
            .map(|backend| {
                debug!(job = %self.name(), backend_id = backend.id, host = %backend.host, "Extra info backend");
                (
                    backend.id.to_string(),
                    json!({ "ip": backend.host, "port": backend.http_port }),
                )
            })
            .collect();
        object.insert(
            "extra_info".to_string(),
            json!({ "be_network_map": be_network_map, "token": token }),
        );
        Ok(serde_json::to_vec(&object)?)
    }

    /// Adopt a restore left running by a previous process. A failed lookup
    /// is retried on the next tick.
    async fn reuse_restore_job(&mut self, scratch: &mut SnapshotScratch) -> Option<Flow> {
        if !self.features().reuse_running_backup_restore_job {
            return None;
        }
        match self.dest_ops.get_valid_restore_job(&scratch.snapshot_name).await {
            Err(err) => {
                warn!(job = %self.name(), error = %err, "Get valid restore job failed");
                Some(Flow::Yield)
            }
            Ok(Some(restore_label)) => {
                info!(job = %self.name(), restore = %restore_label, "Reuse the existing restore job");
                scratch.restore_label = restore_label;
                self.progress
                    .next_sub_volatile(SubSyncState::WaitRestoreDone, None);
                Some(Flow::Continue)
            }
            Ok(None) => None,
        }
    }

    async fn restore(&self, request: &RestoreSnapshotRequest) -> Result<()> {
        let dest = &self.info.dest;
        let dest_rpc = self.ctx.factory.fe_rpc(dest)?;
        let status = dest_rpc.restore_snapshot(dest, request).await?;
        if !status.is_ok() {
            return Err(SyncError::normal(format!(
                "restore snapshot failed, status: {status}"
            )));
        }
        Ok(())
    }

    /// Restore targets of a full sync; empty means the whole snapshot as is.
    fn full_sync_table_refs(&self, scratch: &SnapshotScratch) -> Vec<TableRef> {
        let src = &self.info.src;
        let dest = &self.info.dest;
        let aliases = &self.progress.table_aliases;

        if self.info.is_table_sync_with_alias() {
            let alias = match aliases.get(&dest.table) {
                Some(alias) => {
                    info!(job = %self.name(), table = %dest.table, alias = %alias, "Full sync alias dest table");
                    alias.clone()
                }
                None => dest.table.clone(),
            };
            return vec![TableRef::aliased(src.table.clone(), alias)];
        }
        if aliases.is_empty() {
            return Vec::new();
        }

        let views: BTreeSet<&String> = scratch.views.iter().collect();
        let tables: BTreeSet<&String> = scratch.table_name_mapping.values().collect();
        let mut refs: Vec<TableRef> = views.iter().map(|view| TableRef::plain(*view)).collect();
        refs.extend(
            tables
                .into_iter()
                .filter(|table| !aliases.contains_key(*table) && !views.contains(table))
                .map(TableRef::plain),
        );
        for (table, alias) in aliases {
            info!(job = %self.name(), table = %table, alias = %alias, "Full sync alias table");
            refs.push(TableRef::aliased(table.clone(), alias.clone()));
        }
        refs
    }

    async fn full_restore(&mut self, scratch: &mut SnapshotScratch) -> Result<Flow> {
        info!(job = %self.name(), "Full sync status: restore snapshot");
        if let Some(flow) = self.reuse_restore_job(scratch).await {
            return Ok(flow);
        }

        let features = self.features();
        let compress = if features.compressed_snapshot {
            self.dest_ops
                .is_enable_restore_snapshot_compression()
                .await
                .map_err(|err| err.context("check enable restore snapshot compression failed"))?
        } else {
            false
        };

        let restore_label = label::restore_label(&scratch.snapshot_name);
        info!(
            job = %self.name(),
            snapshot = %scratch.snapshot_name,
            restore = %restore_label,
            "Full sync status: begin restore snapshot"
        );
        let request = RestoreSnapshotRequest {
            table_refs: self.full_sync_table_refs(scratch),
            snapshot_name: restore_label.clone(),
            snapshot: scratch.snapshot_resp.clone(),
            clean_partitions: features.clean_table_and_partitions,
            clean_tables: features.clean_table_and_partitions
                && self.info.sync_type == SyncType::DbSync,
            atomic_restore: features.atomic_restore,
            compress,
        };
        self.restore(&request).await?;

        scratch.restore_label = restore_label;
        self.progress
            .next_sub_volatile(SubSyncState::WaitRestoreDone, None);
        Ok(Flow::Yield)
    }

    async fn partial_restore(&mut self, scratch: &mut SnapshotScratch) -> Result<Flow> {
        info!(job = %self.name(), "Partial sync status: restore snapshot");
        if let Some(flow) = self.reuse_restore_job(scratch).await {
            return Ok(flow);
        }

        let (_, table, _) = self.partial_target();
        let table_refs = if let Some(alias) = self.progress.table_aliases.get(&table) {
            info!(job = %self.name(), table = %table, alias = %alias, "Partial sync with table alias");
            vec![TableRef::aliased(table.clone(), alias.clone())]
        } else if self.info.is_table_sync_with_alias() {
            vec![TableRef::aliased(
                self.info.src.table.clone(),
                self.info.dest.table.clone(),
            )]
        } else {
            Vec::new()
        };

        let restore_label = label::restore_label(&scratch.snapshot_name);
        info!(
            job = %self.name(),
            snapshot = %scratch.snapshot_name,
            restore = %restore_label,
            "Partial sync begin restore snapshot"
        );
        // Existing tables and partitions outside the snapshot stay untouched.
        let request = RestoreSnapshotRequest {
            table_refs,
            snapshot_name: restore_label.clone(),
            snapshot: scratch.snapshot_resp.clone(),
            clean_partitions: false,
            clean_tables: false,
            atomic_restore: false,
            compress: false,
        };
        self.restore(&request).await?;

        scratch.restore_label = restore_label;
        self.progress
            .next_sub_volatile(SubSyncState::WaitRestoreDone, None);
        Ok(Flow::Yield)
    }

    async fn cancel_expired_restore(&self, scratch: &SnapshotScratch) -> Result<bool> {
        if !is_expired(scratch.snapshot_resp.expired_at) {
            return Ok(false);
        }
        warn!(job = %self.name(), restore = %scratch.restore_label, "Cancel the expired restore job");
        self.dest_ops
            .cancel_restore_if_exists(&scratch.restore_label)
            .await?;
        Ok(true)
    }

    async fn full_wait_restore_done(&mut self, scratch: &mut SnapshotScratch) -> Result<Flow> {
        let restore_label = scratch.restore_label.clone();
        if self.cancel_expired_restore(scratch).await? {
            let info = format!("the snapshot {restore_label} is expired");
            info!(job = %self.name(), "force full sync, because {info}");
            let commit_seq = self.progress.commit_seq;
            self.new_snapshot(commit_seq, &info).await?;
            return Ok(Flow::Continue);
        }

        match self.dest_ops.check_restore_finished(&restore_label).await {
            Err(err) => {
                self.progress
                    .next_sub_volatile(SubSyncState::RestoreSnapshot, None);
                Err(err)
            }
            Ok(RestoreProgress::Running) => Ok(Flow::Yield),
            Ok(RestoreProgress::SignatureNotMatched) => {
                self.resolve_signature_not_matched(&restore_label).await
            }
            Ok(RestoreProgress::Finished) => {
                let commit_seq = match self.info.sync_type {
                    SyncType::DbSync => {
                        let commit_seq = min_commit_seq(
                            &scratch.table_commit_seq_map,
                            scratch.snapshot_resp.commit_seq,
                        )
                        .unwrap_or(self.progress.commit_seq);
                        self.progress.table_commit_seq_map =
                            Some(scratch.table_commit_seq_map.clone());
                        self.progress.table_name_mapping = scratch.table_name_mapping.clone();
                        commit_seq
                    }
                    SyncType::TableSync => scratch
                        .table_commit_seq_map
                        .get(&self.info.src.table_id)
                        .copied()
                        .unwrap_or(self.progress.commit_seq),
                };
                info!(job = %self.name(), commit_seq, restore = %restore_label, "Full sync restore finished");
                self.progress
                    .commit_next_sub_with_persist(
                        commit_seq,
                        SubSyncState::PersistRestoreInfo,
                        restore_label,
                    )
                    .await;
                Ok(Flow::Continue)
            }
        }
    }

    /// A destination table or view conflicts with the snapshot. Tables are
    /// restored under an alias when enabled, otherwise the conflict is dropped.
    async fn resolve_signature_not_matched(&mut self, restore_label: &str) -> Result<Flow> {
        let (name, is_table) = match self.info.sync_type {
            SyncType::TableSync => (self.info.dest.table.clone(), true),
            SyncType::DbSync => {
                match self
                    .dest_ops
                    .get_restore_signature_not_matched_table_or_view(restore_label)
                    .await
                {
                    Ok(Some((name, is_table))) if !name.is_empty() => (name, is_table),
                    Ok(_) => return Ok(Flow::Yield),
                    Err(err) => {
                        warn!(job = %self.name(), error = %err, "Get signature not matched table failed");
                        return Ok(Flow::Yield);
                    }
                }
            }
        };

        let resource = if is_table { "table" } else { "view" };
        info!(
            job = %self.name(),
            resource,
            name = %name,
            "The signature is not matched with the target table in snapshot"
        );
        if is_table && self.features().replace_not_matched_with_alias {
            let alias = label::table_alias(&name);
            self.progress.table_aliases.insert(name, alias);
            self.progress
                .next_sub_volatile(SubSyncState::RestoreSnapshot, None);
            return Ok(Flow::Continue);
        }

        let retry_delay = self.ctx.sync.persist_retry_delay();
        loop {
            let dropped = if is_table {
                self.dest_ops.drop_table(&name, false).await
            } else {
                self.dest_ops.drop_view(&name).await
            };
            match dropped {
                Ok(()) => break,
                Err(err) => {
                    warn!(job = %self.name(), resource, name = %name, error = %err, "Drop unmatched resource failed");
                    self.retry_backoff(retry_delay).await?;
                }
            }
        }
        info!(
            job = %self.name(),
            resource,
            name = %name,
            "The restore is cancelled, the unmatched resource is dropped, restore snapshot again"
        );
        self.progress
            .next_sub_volatile(SubSyncState::RestoreSnapshot, None);
        Ok(Flow::Continue)
    }

    async fn partial_wait_restore_done(&mut self, scratch: &mut SnapshotScratch) -> Result<Flow> {
        let (table_id, table, partitions) = self.partial_target();
        let restore_label = scratch.restore_label.clone();
        if self.cancel_expired_restore(scratch).await? {
            info!(job = %self.name(), restore = %restore_label, "Force partial sync, the snapshot is expired");
            let replace = !self.progress.table_aliases.is_empty();
            self.new_partial_snapshot(table_id, &table, partitions, replace)
                .await?;
            return Ok(Flow::Continue);
        }

        match self.dest_ops.check_restore_finished(&restore_label).await {
            Err(err) => {
                self.progress
                    .next_sub_volatile(SubSyncState::RestoreSnapshot, None);
                Err(err)
            }
            Ok(RestoreProgress::Running) => Ok(Flow::Yield),
            Ok(RestoreProgress::SignatureNotMatched) => {
                warn!(
                    job = %self.name(),
                    restore = %restore_label,
                    "Force partial sync with replace, the snapshot signature is not matched"
                );
                self.new_partial_snapshot(table_id, &table, Vec::new(), true)
                    .await?;
                Ok(Flow::Continue)
            }
            Ok(RestoreProgress::Finished) => {
                self.progress
                    .table_commit_seq_map
                    .get_or_insert_with(HashMap::new)
                    .extend(scratch.table_commit_seq_map.iter().map(|(k, v)| (*k, *v)));
                self.progress.table_name_mapping.extend(
                    scratch
                        .table_name_mapping
                        .iter()
                        .map(|(k, v)| (*k, v.clone())),
                );
                self.progress
                    .next_sub_checkpoint(SubSyncState::PersistRestoreInfo, restore_label)
                    .await;
                Ok(Flow::Continue)
            }
        }
    }

    async fn full_persist_restore_info(&mut self) -> Result<Flow> {
        if !self.progress.table_aliases.is_empty() {
            info!(
                job = %self.name(),
                count = self.progress.table_aliases.len(),
                "Full sync swap tables with aliases"
            );
            let aliases: Vec<(String, String)> = self
                .progress
                .table_aliases
                .iter()
                .map(|(table, alias)| (table.clone(), alias.clone()))
                .collect();
            for (table, alias) in aliases {
                let target = if self.info.is_table_sync_with_alias() {
                    self.info.dest.table.clone()
                } else {
                    table
                };
                // The swap may already be done before a restart.
                if self.dest_ops.check_table_exists_by_name(&alias).await? {
                    info!(job = %self.name(), table = %target, alias = %alias, "Full sync swap table with alias");
                    self.dest_ops.replace_table(&alias, &target, false).await?;
                } else {
                    info!(job = %self.name(), table = %target, alias = %alias, "Full sync table alias already swapped");
                }
            }
            self.dest_meta.clear_tables_cache();
            self.progress.table_aliases.clear();
            let persist_data = self.progress.persist_data.clone();
            self.progress
                .next_sub_checkpoint(SubSyncState::PersistRestoreInfo, persist_data)
                .await;
        }

        info!(job = %self.name(), "Full sync status: persist restore info");
        let commit_seq = self.progress.commit_seq;
        match self.info.sync_type {
            SyncType::DbSync => {
                self.dest_meta.clear_tables_cache();
                let table_ids: Vec<i64> = self
                    .progress
                    .table_commit_seq_map
                    .as_ref()
                    .map(|seq_map| seq_map.keys().copied().collect())
                    .unwrap_or_default();

                let mut table_mapping = HashMap::new();
                for src_table_id in table_ids {
                    let src_table = match self.progress.table_name_mapping.get(&src_table_id) {
                        Some(name) => name.clone(),
                        None => {
                            let name = self.src_meta.get_table_name_by_id(src_table_id).await?;
                            if name.is_empty() {
                                warn!(
                                    job = %self.name(),
                                    src_table_id,
                                    "The source table name is empty, no need to map it"
                                );
                                continue;
                            }
                            name
                        }
                    };
                    let dest_table_id = self.dest_meta.get_table_id(&src_table).await?;
                    debug!(
                        job = %self.name(),
                        src_table_id,
                        dest_table_id,
                        table = %src_table,
                        "Full sync table mapping"
                    );
                    table_mapping.insert(src_table_id, dest_table_id);
                }

                self.progress.table_mapping = table_mapping;
                self.progress.shadow_indexes.clear();
                self.progress
                    .next_with_persist(
                        commit_seq,
                        SyncState::DbTablesIncrementalSync,
                        SubSyncState::Done,
                        String::new(),
                    )
                    .await;
            }
            SyncType::TableSync => {
                let dest_table = self.dest_meta.update_table(&self.info.dest.table, 0).await?;
                self.info.dest.table_id = dest_table.id;
                self.persist_job().await?;

                self.progress.table_commit_seq_map = None;
                self.progress.table_mapping.clear();
                self.progress.shadow_indexes.clear();
                self.progress
                    .next_with_persist(
                        commit_seq,
                        SyncState::TableIncrementalSync,
                        SubSyncState::Done,
                        String::new(),
                    )
                    .await;
            }
        }
        Ok(Flow::Yield)
    }

    async fn partial_persist_restore_info(&mut self) -> Result<Flow> {
        let (table_id, table, _) = self.partial_target();
        let target = if self.info.is_table_sync_with_alias() {
            self.info.dest.table.clone()
        } else {
            table.clone()
        };

        if let Some(alias) = self.progress.table_aliases.get(&table).cloned() {
            if self.dest_ops.check_table_exists_by_name(&alias).await? {
                if self.dest_ops.check_table_exists_by_name(&target).await? {
                    info!(job = %self.name(), table = %target, alias = %alias, "Partial sync swap table with alias");
                    self.dest_ops.replace_table(&alias, &target, false).await?;
                } else {
                    info!(job = %self.name(), table = %target, alias = %alias, "Partial sync rename table alias");
                    self.dest_ops.rename_table_with_name(&alias, &target).await?;
                }
                self.dest_meta.clear_tables_cache();
            } else {
                info!(job = %self.name(), table = %target, alias = %alias, "Partial sync table alias already swapped");
            }

            self.progress.table_aliases.clear();
            let persist_data = self.progress.persist_data.clone();
            self.progress
                .next_sub_checkpoint(SubSyncState::PersistRestoreInfo, persist_data)
                .await;
        }

        info!(job = %self.name(), "Partial sync status: persist restore info");
        let dest_table = self.dest_meta.update_table(&target, 0).await?;
        match self.info.sync_type {
            SyncType::DbSync => {
                self.progress.table_mapping.insert(table_id, dest_table.id);
                let commit_seq = self.progress.commit_seq;
                self.progress
                    .next_with_persist(
                        commit_seq,
                        SyncState::DbTablesIncrementalSync,
                        SubSyncState::Done,
                        String::new(),
                    )
                    .await;
            }
            SyncType::TableSync => {
                let src_table_id = self.info.src.table_id;
                let Some(commit_seq) = self
                    .progress
                    .table_commit_seq_map
                    .as_ref()
                    .and_then(|seq_map| seq_map.get(&src_table_id).copied())
                else {
                    return Err(SyncError::normal(format!(
                        "table id {src_table_id}, commit seq not found"
                    )));
                };
                self.info.dest.table_id = dest_table.id;
                self.persist_job().await?;
                self.progress.table_mapping.clear();
                self.progress.table_commit_seq_map = None;
                self.progress
                    .next_with_persist(
                        commit_seq,
                        SyncState::TableIncrementalSync,
                        SubSyncState::Done,
                        String::new(),
                    )
                    .await;
            }
        }
        Ok(Flow::Yield)
    }

    /// The partial snapshot target is gone upstream: dropped or renamed.
    async fn handle_partial_sync_table_not_found(&mut self) -> Result<()> {
        let (table_id, table, _) = self.partial_target();

        // Progress written by older versions has no table id.
        let dropped = if table_id == 0 {
            false
        } else {
            let src = &self.info.src;
            let fe = self.ctx.factory.fe_rpc(src)?;
            MetaSnapshot::fetch(fe.as_ref(), src, &[table_id])
                .await?
                .is_table_dropped(table_id)
        };

        if dropped {
            if self.is_table_sync() {
                return Err(SyncError::normal(format!(
                    "table sync but table {table} has been dropped, table id {table_id}"
                )));
            }
            warn!(
                job = %self.name(),
                table = %table,
                table_id,
                "Skip this partial sync because the table has been dropped"
            );
            // The drop entry's sequence is unknown, so every later entry of this table is skipped.
            self.progress
                .table_commit_seq_map
                .get_or_insert_with(HashMap::new)
                .insert(table_id, i64::MAX);
            let commit_seq = self.progress.commit_seq;
            self.progress
                .next_with_persist(
                    commit_seq,
                    SyncState::DbTablesIncrementalSync,
                    SubSyncState::Done,
                    String::new(),
                )
                .await;
            return Ok(());
        }

        let new_table = self.src_meta.get_table_name_by_id(table_id).await?;
        if self.is_table_sync() {
            return Err(SyncError::normal(format!(
                "table sync but table has renamed from {table} to {new_table}, table id {table_id}"
            )));
        }
        warn!(
            job = %self.name(),
            table_id,
            from = %table,
            to = %new_table,
            "Force new partial snapshot, the table has been renamed"
        );
        self.new_partial_snapshot(table_id, &new_table, Vec::new(), true)
            .await
    }
}

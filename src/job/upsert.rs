//! Replay of a data change inside one destination transaction.
//!
//! The protocol steps through `BeginTransaction`, `IngestBinlog` and
//! `CommitTransaction`, with `RollbackTransaction` on failure. Steps after
//! `BeginTransaction` checkpoint the working set, so a restart resumes the
//! same destination transaction instead of opening a new one.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, error, info, warn};

use super::{JobCore, SyncType, label};
use crate::error::{ErrorKind, Result, SyncError};
use crate::ingest::{IngestOutcome, IngestScope};
use crate::progress::{Scratch, SubSyncState, UpsertScratch};
use crate::record::{TableRecord, Upsert};
use crate::rpc::{Binlog, Status, StatusCode, SubTxnInfo};

static TXN_NOT_FOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"transaction \[\d+\] not found").expect("static regex"));

fn is_txn_not_found(status: &Status) -> bool {
    status.contains_any(&["transaction not found"])
        || status.error_msgs.iter().any(|msg| TXN_NOT_FOUND.is_match(msg))
}

fn is_txn_aborted(status: &Status) -> bool {
    status.contains_any(&["is already aborted"])
}

fn is_txn_committed(status: &Status) -> bool {
    status.contains_any(&["is already COMMITTED"])
}

fn is_table_not_found(status: &Status) -> bool {
    status.contains_any(&["can't find table id:", "table not found", "unknown table"])
}

/// Destination sub-transaction ids written by the partitions of the records
/// that map to `dest_table_id`.
fn stids_by_dest_table(
    dest_table_id: i64,
    records: &[TableRecord],
    resolve: impl Fn(i64) -> Option<i64>,
    stid_map: &HashMap<i64, i64>,
) -> BTreeSet<i64> {
    records
        .iter()
        .filter(|record| resolve(record.id) == Some(dest_table_id))
        .flat_map(|record| record.partition_records.iter())
        .filter_map(|partition| stid_map.get(&partition.stid).copied())
        .filter(|stid| *stid != 0)
        .collect()
}

impl JobCore {
    /// Replay an upsert, retrying once from scratch on a meta error.
    pub(super) async fn handle_upsert_with_retry(&mut self, binlog: &Binlog) -> Result<()> {
        match self.handle_upsert(Some(binlog)).await {
            Err(err) if err.is_meta() => {
                warn!(job = %self.name(), error = %err, "Upsert failed with meta error, retry");
                if self.progress.sub_sync_state == SubSyncState::RollbackTransaction {
                    self.handle_upsert(None).await?;
                    if self.progress.is_done() && self.progress.commit_seq == binlog.commit_seq {
                        // Found committed while rolling back.
                        return Ok(());
                    }
                    self.progress.start_handle(binlog.commit_seq).await;
                }
                self.handle_upsert(Some(binlog)).await
            }
            other => other,
        }
    }

    /// Step the upsert protocol. `None` resumes an interrupted protocol.
    pub(super) async fn handle_upsert(&mut self, binlog: Option<&Binlog>) -> Result<()> {
        loop {
            match self.progress.sub_sync_state {
                SubSyncState::Done => {
                    let Some(binlog) = binlog else {
                        error!(job = %self.name(), "Resume upsert without binlog");
                        return Ok(());
                    };
                    let Some(scratch) = self.prepare_upsert(binlog).await? else {
                        return Ok(());
                    };
                    self.progress.next_sub_volatile(
                        SubSyncState::BeginTransaction,
                        Some(Scratch::Upsert(Box::new(scratch))),
                    );
                }
                SubSyncState::BeginTransaction => self.begin_transaction().await?,
                SubSyncState::IngestBinlog => self.ingest_binlog().await?,
                SubSyncState::CommitTransaction => return self.commit_transaction().await,
                SubSyncState::RollbackTransaction => return self.rollback_transaction().await,
                other => {
                    return Err(SyncError::normal(format!(
                        "invalid job sub sync state {other}"
                    )));
                }
            }
        }
    }

    async fn prepare_upsert(&mut self, binlog: &Binlog) -> Result<Option<UpsertScratch>> {
        let upsert = Upsert::from_json(&binlog.data)?;
        debug!(
            job = %self.name(),
            commit_seq = upsert.commit_seq,
            tables = upsert.table_records.len(),
            "Handle upsert"
        );

        let is_txn_insert = !upsert.stids.is_empty();
        if is_txn_insert && !self.features().txn_insert {
            warn!(job = %self.name(), commit_seq = upsert.commit_seq, "Txn insert is disabled");
            return Err(SyncError::normal("The txn insert is not supported yet"));
        }

        let candidates = self.related_table_records(&upsert)?;
        if candidates.is_empty() {
            debug!(job = %self.name(), commit_seq = upsert.commit_seq, "No related table records");
            return Ok(None);
        }

        let mut table_records = Vec::with_capacity(candidates.len());
        let mut dest_table_ids = Vec::with_capacity(candidates.len());
        match self.info.sync_type {
            SyncType::DbSync => {
                for record in candidates {
                    if self.is_materialized_view_table(record.id).await? {
                        info!(job = %self.name(), table_id = record.id, "Skip upsert of materialized view");
                        continue;
                    }
                    let dest_table_id = self.get_dest_table_id_by_src(record.id).await?;
                    dest_table_ids.push(dest_table_id);
                    table_records.push(record);
                }
            }
            SyncType::TableSync => {
                dest_table_ids.push(self.info.dest.table_id);
                table_records = candidates;
            }
        }
        if table_records.is_empty() {
            return Ok(None);
        }

        Ok(Some(UpsertScratch {
            commit_seq: upsert.commit_seq,
            dest_table_ids,
            table_records,
            is_txn_insert,
            source_stids: upsert.stids,
            label: upsert.label,
            ..UpsertScratch::default()
        }))
    }

    /// Records this job replicates and has not yet applied.
    fn related_table_records(&self, upsert: &Upsert) -> Result<Vec<TableRecord>> {
        match self.info.sync_type {
            SyncType::DbSync => {
                let records = upsert.table_records.values();
                Ok(match &self.progress.table_commit_seq_map {
                    None => records.cloned().collect(),
                    Some(seq_map) => records
                        .filter(|record| match seq_map.get(&record.id) {
                            Some(seq) => upsert.commit_seq > *seq,
                            None => true,
                        })
                        .cloned()
                        .collect(),
                })
            }
            SyncType::TableSync => upsert
                .table_records
                .get(&self.info.src.table_id)
                .map(|record| vec![record.clone()])
                .ok_or_else(|| {
                    SyncError::normal(format!(
                        "table record not found, table: {}",
                        self.info.src.table
                    ))
                }),
        }
    }

    /// Working set of the protocol, restored from the checkpoint after a restart.
    fn upsert_scratch(&self) -> Result<UpsertScratch> {
        if let Some(Scratch::Upsert(scratch)) = &self.progress.in_memory {
            return Ok((**scratch).clone());
        }
        serde_json::from_str(&self.progress.persist_data).map_err(|e| {
            SyncError::wrap(
                ErrorKind::Normal,
                format!(
                    "unmarshal persistData failed, persistData: {}",
                    self.progress.persist_data
                ),
                e,
            )
        })
    }

    async fn upsert_checkpoint(&mut self, sub: SubSyncState, scratch: UpsertScratch) -> Result<()> {
        let data = serde_json::to_string(&scratch)?;
        self.progress.in_memory = Some(Scratch::Upsert(Box::new(scratch)));
        self.progress.next_sub_checkpoint(sub, data).await;
        Ok(())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        let mut scratch = self.upsert_scratch()?;
        let dest = &self.info.dest;
        let dest_rpc = self.ctx.factory.fe_rpc(dest)?;

        let txn_label = if self.info.extra.reuse_binlog_label {
            scratch.label.clone()
        } else {
            label::txn_label(self.info.sync_type, &self.info.src, dest, scratch.commit_seq)
        };

        let resp = if scratch.is_txn_insert {
            dest_rpc
                .begin_transaction_for_txn_insert(
                    dest,
                    &txn_label,
                    &scratch.dest_table_ids,
                    scratch.source_stids.len() as i64,
                )
                .await?
        } else {
            dest_rpc
                .begin_transaction(dest, &txn_label, &scratch.dest_table_ids)
                .await?
        };

        if !resp.status.is_ok() {
            if is_table_not_found(&resp.status) && self.info.sync_type == SyncType::DbSync {
                // The cached mapping points at a table that is gone; rebuild it on retry.
                for record in &scratch.table_records {
                    self.progress.table_mapping.remove(&record.id);
                }
                self.progress.rollback().await;
            }
            return Err(SyncError::normal(format!(
                "begin txn failed, status: {}",
                resp.status
            )));
        }

        info!(
            job = %self.name(),
            txn_id = resp.txn_id,
            label = %txn_label,
            sub_txn_ids = ?resp.sub_txn_ids,
            "Begin txn"
        );
        scratch.txn_id = resp.txn_id;
        if scratch.is_txn_insert {
            scratch.dest_stids = resp.sub_txn_ids;
        }
        self.upsert_checkpoint(SubSyncState::IngestBinlog, scratch).await
    }

    async fn ingest_binlog(&mut self) -> Result<()> {
        let mut scratch = self.upsert_scratch()?;
        let stid_map: HashMap<i64, i64> = if scratch.is_txn_insert
            && scratch.source_stids.len() == scratch.dest_stids.len()
        {
            scratch
                .source_stids
                .iter()
                .copied()
                .zip(scratch.dest_stids.iter().copied())
                .collect()
        } else {
            HashMap::new()
        };

        let scope = IngestScope {
            src: &self.info.src,
            dest: &self.info.dest,
            table_sync: self.is_table_sync(),
            table_mapping: &self.progress.table_mapping,
            shadow_indexes: self
                .features()
                .filter_shadow_indexes_upsert
                .then_some(&self.progress.shadow_indexes),
        };
        let result = self
            .ingester
            .ingest(scope, scratch.txn_id, &scratch.table_records, &stid_map)
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.rollback_upsert(&err, scratch).await?;
                return Err(err);
            }
        };

        if scratch.is_txn_insert {
            scratch.sub_txn_infos = self.sub_txn_infos(&scratch, &stid_map, &outcome);
        } else {
            scratch.commit_infos = outcome.commit_infos;
        }
        self.upsert_checkpoint(SubSyncState::CommitTransaction, scratch).await
    }

    /// Group acknowledgements by destination sub-transaction, per destination table.
    fn sub_txn_infos(
        &self,
        scratch: &UpsertScratch,
        stid_map: &HashMap<i64, i64>,
        outcome: &IngestOutcome,
    ) -> Vec<SubTxnInfo> {
        let resolve = |src_table_id: i64| match self.info.sync_type {
            SyncType::TableSync => Some(self.info.dest.table_id),
            SyncType::DbSync => self.progress.table_mapping.get(&src_table_id).copied(),
        };

        let mut infos = Vec::new();
        for dest_table_id in &scratch.dest_table_ids {
            let stids =
                stids_by_dest_table(*dest_table_id, &scratch.table_records, resolve, stid_map);
            for stid in stids {
                match outcome.sub_txn_commit_infos.get(&stid) {
                    Some(commit_infos) => infos.push(SubTxnInfo {
                        sub_txn_id: stid,
                        table_id: *dest_table_id,
                        tablet_commit_infos: commit_infos.clone(),
                    }),
                    None => warn!(
                        job = %self.name(),
                        stid,
                        dest_table_id,
                        "No commit infos for sub txn"
                    ),
                }
            }
        }
        infos
    }

    async fn rollback_upsert(&mut self, err: &SyncError, scratch: UpsertScratch) -> Result<()> {
        error!(
            job = %self.name(),
            txn_id = scratch.txn_id,
            error = %err,
            "Upsert failed, rollback txn"
        );
        self.upsert_checkpoint(SubSyncState::RollbackTransaction, scratch).await
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        let scratch = self.upsert_scratch()?;
        let dest = &self.info.dest;
        let commit = async {
            let dest_rpc = self.ctx.factory.fe_rpc(dest)?;
            if scratch.is_txn_insert {
                dest_rpc
                    .commit_transaction_for_txn_insert(dest, scratch.txn_id, &scratch.sub_txn_infos)
                    .await
            } else {
                dest_rpc
                    .commit_transaction(dest, scratch.txn_id, &scratch.commit_infos)
                    .await
            }
        };

        let status = match commit.await {
            Ok(status) => status,
            Err(err) => {
                self.rollback_upsert(&err, scratch).await?;
                return Err(err);
            }
        };

        if status.code == StatusCode::PublishTimeout {
            info!(job = %self.name(), txn_id = scratch.txn_id, "Publish timeout, wait txn done");
            self.dest_ops.wait_transaction_done(scratch.txn_id).await;
        } else if !status.is_ok() {
            let err = SyncError::normal(format!("commit txn failed, status: {status}"));
            self.rollback_upsert(&err, scratch).await?;
            return Err(err);
        }

        info!(job = %self.name(), txn_id = scratch.txn_id, "Commit txn success");
        self.upsert_committed(&scratch).await;
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        let scratch = self.upsert_scratch()?;
        let dest = &self.info.dest;
        let dest_rpc = self.ctx.factory.fe_rpc(dest)?;
        let status = dest_rpc.rollback_transaction(dest, scratch.txn_id).await?;

        if !status.is_ok() {
            if is_txn_not_found(&status) {
                warn!(job = %self.name(), txn_id = scratch.txn_id, "Rollback txn not found");
            } else if is_txn_aborted(&status) {
                info!(job = %self.name(), txn_id = scratch.txn_id, "Txn is already aborted");
            } else if is_txn_committed(&status) {
                info!(job = %self.name(), txn_id = scratch.txn_id, "Txn is already committed");
                self.upsert_committed(&scratch).await;
                return Ok(());
            } else {
                return Err(SyncError::normal(format!(
                    "rollback txn failed, status: {status}"
                )));
            }
        }

        info!(job = %self.name(), txn_id = scratch.txn_id, "Rollback txn success");
        self.progress.rollback().await;
        Ok(())
    }

    /// Advance per-table watermarks of the replayed tables, then confirm.
    async fn upsert_committed(&mut self, scratch: &UpsertScratch) {
        if self.info.sync_type == SyncType::DbSync {
            if let Some(seq_map) = self.progress.table_commit_seq_map.as_mut() {
                for record in &scratch.table_records {
                    if let Some(seq) = seq_map.get_mut(&record.id) {
                        if *seq < scratch.commit_seq {
                            *seq = scratch.commit_seq;
                        }
                    }
                }
            }
        }
        self.progress.done().await;
    }
}

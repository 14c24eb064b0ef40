//! Incremental sync: pull changelog entries and replay them one by one.
//!
//! Every entry moves the in-flight watermark first (`start_handle`) and is
//! confirmed only after its handler succeeds. Handlers for DDL-like entries
//! consult the per-table watermarks so entries already covered by the last
//! snapshot are not applied twice.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, error, info, trace, warn};

use super::{JobCore, SkipBy, SyncType};
use crate::error::{Result, SyncError};
use crate::record::{
    AddPartition, AlterJobV2, AlterView, BarrierLog, CreateTable, DropPartition, DropRollup,
    DropTable, IndexChangeJob, ModifyComment, ModifyTableAddOrDropColumns,
    ModifyTableAddOrDropInvertedIndices, ModifyTableProperty, RecoverInfo, RenameColumn,
    RenamePartition, RenameRollup, RenameTable, ReplacePartition, ReplaceTable, TableType,
    TruncateTable,
};
use crate::progress::{SubSyncState, SyncState};
use crate::rpc::{Binlog, BinlogType, StatusCode};
use crate::telemetry;

static SESSION_VARIABLE_REQUIRED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"set enable_.+=.+|Incorrect column name .* Column regex is")
        .expect("static regex")
});

/// The create statement needs a session variable the destination session lacks.
fn is_session_variable_required(message: &str) -> bool {
    SESSION_VARIABLE_REQUIRED.is_match(message)
}

impl JobCore {
    pub(super) async fn incremental_sync(&mut self) -> Result<()> {
        if !self.progress.is_done() {
            info!(
                job = %self.name(),
                sub_sync_state = %self.progress.sub_sync_state,
                prev_commit_seq = self.progress.prev_commit_seq,
                commit_seq = self.progress.commit_seq,
                "Job progress is not done, recover"
            );
            return self.recover_incremental_sync().await;
        }

        if self.info.extra.skip_binlog && self.info.extra.skip_by == Some(SkipBy::FullSync) {
            let info = format!(
                "the user required skipping the binlog, commit seq {}",
                self.progress.commit_seq
            );
            warn!(job = %self.name(), "force full sync, because {info}");
            let commit_seq = self.progress.commit_seq;
            return self.new_snapshot(commit_seq, &info).await;
        }

        let src_rpc = self.ctx.factory.fe_rpc(&self.info.src)?;
        loop {
            let commit_seq = self.progress.commit_seq;
            trace!(job = %self.name(), commit_seq, "Get binlog");
            let resp = src_rpc.get_binlog(&self.info.src, commit_seq).await?;

            match resp.status.code {
                StatusCode::Ok | StatusCode::BinlogTooOldCommitSeq => {}
                StatusCode::BinlogTooNewCommitSeq => return Ok(()),
                StatusCode::BinlogDisable => return Err(SyncError::normal("binlog is disabled")),
                StatusCode::BinlogNotFoundDb => return Err(SyncError::normal("can't found db")),
                StatusCode::BinlogNotFoundTable => {
                    return Err(SyncError::normal("can't found table"));
                }
                other => {
                    return Err(SyncError::normal(format!(
                        "invalid binlog status type: {other}, msg: {}",
                        resp.status.first_message()
                    )));
                }
            }

            if resp.binlogs.is_empty() {
                return Err(SyncError::normal(format!(
                    "no binlog, but status code is: {}",
                    resp.status.code
                )));
            }

            if self.handle_binlogs(&resp.binlogs).await? {
                return Ok(());
            }
        }
    }

    async fn recover_incremental_sync(&mut self) -> Result<()> {
        match self.progress.sub_sync_state.binlog_type() {
            Some(BinlogType::Upsert) => self.handle_upsert(None).await,
            _ => {
                self.progress.rollback().await;
                Ok(())
            }
        }
    }

    /// Replay a batch. Returns `true` when a handler left incremental sync
    /// and the rest of the batch must wait for the next tick.
    async fn handle_binlogs(&mut self, binlogs: &[Binlog]) -> Result<bool> {
        trace!(job = %self.name(), size = binlogs.len(), "Handle binlogs");
        for binlog in binlogs {
            if let Err(err) = self.handle_binlog(binlog).await {
                error!(
                    job = %self.name(),
                    prev_commit_seq = self.progress.prev_commit_seq,
                    commit_seq = self.progress.commit_seq,
                    binlog_type = %binlog.binlog_type,
                    data = %binlog.data,
                    error = %err,
                    "Handle binlog failed"
                );
                return Err(err);
            }

            if !self.progress.sync_state.is_incremental() {
                trace!(
                    job = %self.name(),
                    sync_state = %self.progress.sync_state,
                    "Job left incremental sync, back to run loop"
                );
                return Ok(true);
            }

            let commit_seq = binlog.commit_seq;
            if self.info.sync_type == SyncType::DbSync {
                let caught_up = self
                    .progress
                    .table_commit_seq_map
                    .as_ref()
                    .is_some_and(|seq_map| seq_map.values().all(|seq| *seq <= commit_seq));
                if caught_up {
                    info!(
                        job = %self.name(),
                        commit_seq,
                        "All tables reach the commit seq, switch to db incremental sync"
                    );
                    self.progress.table_commit_seq_map = None;
                    let commit_seq = self.progress.commit_seq;
                    self.progress
                        .next_with_persist(
                            commit_seq,
                            SyncState::DbIncrementalSync,
                            SubSyncState::Done,
                            String::new(),
                        )
                        .await;
                }
            }

            if !self.progress.is_done() {
                self.progress.done().await;
            }
        }
        Ok(false)
    }

    async fn handle_binlog(&mut self, binlog: &Binlog) -> Result<()> {
        if !self.progress.is_done() {
            return Err(SyncError::normal(format!(
                "the progress isn't done, need rollback, commit seq: {}",
                self.progress.commit_seq
            )));
        }

        debug!(
            job = %self.name(),
            binlog_type = %binlog.binlog_type,
            commit_seq = binlog.commit_seq,
            data = %binlog.data,
            "Handle binlog"
        );
        self.progress.start_handle(binlog.commit_seq).await;
        telemetry::record_binlog_handled(&self.info.name, binlog.binlog_type.as_str());

        let extra = &self.info.extra;
        if extra.skip_binlog
            && extra.skip_by == Some(SkipBy::Silence)
            && extra.skip_commit_seq == binlog.commit_seq
        {
            warn!(
                job = %self.name(),
                commit_seq = binlog.commit_seq,
                binlog_type = %binlog.binlog_type,
                data = %binlog.data,
                "Silently skip binlog by user"
            );
            return Ok(());
        }

        let seq = binlog.commit_seq;
        let data = binlog.data.as_str();
        match binlog.binlog_type {
            BinlogType::Upsert => self.handle_upsert_with_retry(binlog).await,
            BinlogType::AddPartition => self.handle_add_partition(seq, data).await,
            BinlogType::CreateTable => self.handle_create_table(seq, data).await,
            BinlogType::DropPartition => self.handle_drop_partition(seq, data).await,
            BinlogType::DropTable => self.handle_drop_table(seq, data).await,
            BinlogType::AlterJob => self.handle_alter_job(seq, data).await,
            BinlogType::ModifyTableAddOrDropColumns => {
                self.handle_lightning_schema_change(seq, data).await
            }
            BinlogType::RenameColumn => {
                self.handle_rename_column(seq, RenameColumn::from_json(data)?).await
            }
            BinlogType::ModifyComment => {
                self.handle_modify_comment(seq, ModifyComment::from_json(data)?).await
            }
            BinlogType::Dummy => self.handle_dummy(seq).await,
            BinlogType::AlterDatabaseProperty => {
                info!(job = %self.name(), "Ignore alter database property binlog");
                Ok(())
            }
            BinlogType::ModifyTableProperty => self.handle_modify_property(seq, data).await,
            BinlogType::Barrier => self.handle_barrier(seq, data).await,
            BinlogType::TruncateTable => self.handle_truncate_table(seq, data).await,
            BinlogType::RenameTable => {
                self.handle_rename_table(seq, RenameTable::from_json(data)?).await
            }
            BinlogType::ReplacePartitions => self.handle_replace_partitions(seq, data).await,
            BinlogType::ModifyPartitions => {
                warn!(job = %self.name(), data, "Modify partitions is not supported, skip");
                Ok(())
            }
            BinlogType::ReplaceTable => {
                self.handle_replace_table(seq, ReplaceTable::from_json(data)?).await
            }
            BinlogType::ModifyViewDef => {
                self.handle_alter_view_def(seq, AlterView::from_json(data)?).await
            }
            BinlogType::ModifyTableAddOrDropInvertedIndices => {
                let record = ModifyTableAddOrDropInvertedIndices::from_json(data)?;
                self.handle_inverted_indices(seq, record).await
            }
            BinlogType::IndexChangeJob => {
                self.handle_index_change_job(seq, IndexChangeJob::from_json(data)?).await
            }
            BinlogType::RenamePartition => {
                self.handle_rename_partition(seq, RenamePartition::from_json(data)?).await
            }
            BinlogType::RenameRollup => {
                self.handle_rename_rollup(seq, RenameRollup::from_json(data)?).await
            }
            BinlogType::DropRollup => {
                self.handle_drop_rollup(seq, DropRollup::from_json(data)?).await
            }
            BinlogType::RecoverInfo => {
                self.handle_recover_info(seq, RecoverInfo::from_json(data)?).await
            }
            other => Err(SyncError::normal(format!("unknown binlog type: {other}"))),
        }
    }

    /// Whether the last snapshot already covers `commit_seq` for this table.
    fn is_binlog_committed(&self, table_id: i64, commit_seq: i64) -> bool {
        if self.progress.sync_state != SyncState::DbTablesIncrementalSync {
            return false;
        }
        let committed = self
            .progress
            .table_commit_seq_map
            .as_ref()
            .and_then(|seq_map| seq_map.get(&table_id))
            .is_some_and(|table_commit_seq| commit_seq <= *table_commit_seq);
        if committed {
            info!(
                job = %self.name(),
                table_id,
                commit_seq,
                "Filter the already committed binlog"
            );
        }
        committed
    }

    pub(super) async fn is_materialized_view_table(&mut self, src_table_id: i64) -> Result<bool> {
        if self.is_table_sync() && src_table_id == self.info.src.table_id {
            return Ok(false);
        }
        if self.progress.table_mapping.contains_key(&src_table_id) {
            return Ok(false);
        }
        if self.mv_tables.contains(&src_table_id) {
            return Ok(true);
        }

        let table = self.src_meta.get_table(src_table_id).await?;
        if table.table_type == TableType::MaterializedView {
            self.mv_tables.insert(src_table_id);
            return Ok(true);
        }
        Ok(false)
    }

    pub(super) async fn get_dest_table_id_by_src(&mut self, src_table_id: i64) -> Result<i64> {
        if self.is_table_sync() {
            return Ok(self.info.dest.table_id);
        }
        if let Some(dest_table_id) = self.progress.table_mapping.get(&src_table_id) {
            return Ok(*dest_table_id);
        }
        warn!(job = %self.name(), src_table_id, "Table mapping not found");

        let table = self.src_meta.get_table(src_table_id).await?;
        if table.table_type == TableType::MaterializedView {
            return Err(SyncError::meta("Not support table type: materialized view"));
        }
        let dest_table_id = self.dest_meta.get_table_id(&table.name).await?;
        self.progress.table_mapping.insert(src_table_id, dest_table_id);
        Ok(dest_table_id)
    }

    pub(super) async fn get_dest_name_by_src_id(&mut self, src_table_id: i64) -> Result<String> {
        if self.is_table_sync() {
            return Ok(self.info.dest.table.clone());
        }
        let dest_table_id = self.get_dest_table_id_by_src(src_table_id).await?;
        let name = self.dest_meta.get_table_name_by_id(dest_table_id).await?;
        if name.is_empty() {
            return Err(SyncError::normal(format!(
                "dest table name not found, src table id: {src_table_id}, dest table id: {dest_table_id}"
            )));
        }
        Ok(name)
    }

    /// Destination table named by the entry itself in database scope.
    fn dest_table_or(&self, table_name: &str) -> String {
        match self.info.sync_type {
            SyncType::TableSync => self.info.dest.table.clone(),
            SyncType::DbSync => table_name.to_string(),
        }
    }

    fn remove_table_commit_seq(&mut self, table_id: i64) {
        if let Some(seq_map) = self.progress.table_commit_seq_map.as_mut() {
            seq_map.remove(&table_id);
        }
    }

    async fn handle_add_partition(&mut self, commit_seq: i64, data: &str) -> Result<()> {
        let record = AddPartition::from_json(data)?;
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }
        if self.is_materialized_view_table(record.table_id).await? {
            warn!(job = %self.name(), table_id = record.table_id, "Skip add partition of materialized view");
            return Ok(());
        }
        if record.is_temp {
            info!(job = %self.name(), sql = %record.sql, "Skip add temporary partition");
            return Ok(());
        }

        let dest_table = self.get_dest_name_by_src_id(record.table_id).await?;
        self.dest_ops.add_partition(&dest_table, &record).await
    }

    async fn handle_drop_partition(&mut self, commit_seq: i64, data: &str) -> Result<()> {
        let record = DropPartition::from_json(data)?;
        if record.is_temp {
            info!(job = %self.name(), sql = %record.sql, "Skip drop temporary partition");
            return Ok(());
        }
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }
        if self.is_materialized_view_table(record.table_id).await? {
            warn!(job = %self.name(), table_id = record.table_id, "Skip drop partition of materialized view");
            return Ok(());
        }

        let dest_table = self.get_dest_name_by_src_id(record.table_id).await?;
        self.dest_ops.drop_partition(&dest_table, &record).await
    }

    async fn handle_create_table(&mut self, commit_seq: i64, data: &str) -> Result<()> {
        if self.info.sync_type != SyncType::DbSync {
            return Err(SyncError::normal(format!(
                "invalid sync type: {}",
                self.info.sync_type
            )));
        }

        let mut record = CreateTable::from_json(data)?;
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }
        if record.is_create_materialized_view() {
            warn!(job = %self.name(), "Create async materialized view is not supported, skip");
            return Ok(());
        }

        if self.features().create_view_drop_exists {
            let view = record.table_name.trim();
            if record.is_create_view() && !view.is_empty() {
                info!(job = %self.name(), view, "Drop view before creating");
                self.dest_ops.drop_view(view).await.map_err(|err| {
                    err.context(format!(
                        "drop view before create view {view}, table id={}",
                        record.table_id
                    ))
                })?;
            }
        }

        if record.is_create_table_with_inverted_index() {
            info!(
                job = %self.name(),
                table = %record.table_name,
                commit_seq,
                "Create table with inverted index, force partial snapshot"
            );
            return self
                .new_partial_snapshot(record.table_id, &record.table_name, Vec::new(), true)
                .await;
        }

        // Entries skipped by a snapshot may leave the table behind.
        if !record.is_create_view()
            && self
                .dest_ops
                .check_table_exists_by_name(&record.table_name)
                .await?
        {
            warn!(
                job = %self.name(),
                table = %record.table_name,
                commit_seq,
                "Dest table already exists, force partial snapshot"
            );
            return self
                .new_partial_snapshot(record.table_id, &record.table_name, Vec::new(), true)
                .await;
        }

        if self.features().filter_storage_medium {
            record.strip_storage_medium();
        }

        if let Err(err) = self
            .dest_ops
            .create_table_or_view(&record, &self.info.src.database)
            .await
        {
            let message = err.message();
            if message.contains("Can not found function") || message.contains("Can not find resource") {
                warn!(job = %self.name(), error = %err, "Skip creating table, not supported");
                return Ok(());
            }
            if !record.table_name.is_empty() && is_session_variable_required(message) {
                info!(
                    job = %self.name(),
                    table = %record.table_name,
                    commit_seq,
                    error = %err,
                    "A session variable is required, force partial snapshot"
                );
                return self
                    .new_partial_snapshot(record.table_id, &record.table_name, Vec::new(), false)
                    .await;
            }
            return Err(err.context(format!("create table {}", record.table_id)));
        }

        self.src_meta.clear_tables_cache();
        self.dest_meta.clear_tables_cache();

        let src_table = if record.table_name.is_empty() {
            let name = self.src_meta.get_table_name_by_id(record.table_id).await?;
            if name.is_empty() {
                return Err(SyncError::normal(format!(
                    "the table with id {} is not found in the upstream cluster",
                    record.table_id
                )));
            }
            name
        } else {
            record.table_name.clone()
        };

        let dest_table_id = self.dest_meta.get_table_id(&src_table).await?;
        self.progress.table_mapping.insert(record.table_id, dest_table_id);
        self.progress
            .table_name_mapping
            .insert(record.table_id, src_table);
        self.progress.done().await;
        Ok(())
    }

    async fn handle_drop_table(&mut self, commit_seq: i64, data: &str) -> Result<()> {
        if self.info.sync_type != SyncType::DbSync {
            return Err(SyncError::normal(format!(
                "invalid sync type: {}",
                self.info.sync_type
            )));
        }

        let record = DropTable::from_json(data)?;
        if !record.is_view && !self.progress.table_mapping.contains_key(&record.table_id) {
            warn!(
                job = %self.name(),
                table_id = record.table_id,
                commit_seq,
                "Dest table not found, skip drop table"
            );
            self.remove_table_commit_seq(record.table_id);
            return Ok(());
        }
        if self.is_binlog_committed(record.table_id, commit_seq) {
            self.remove_table_commit_seq(record.table_id);
            return Ok(());
        }

        let table = if record.table_name.is_empty() {
            self.src_meta
                .dirty_get_tables()
                .get(&record.table_id)
                .map(|table| table.name.clone())
                .ok_or_else(|| {
                    SyncError::normal(format!("table not found, tableId: {}", record.table_id))
                })?
        } else {
            record.table_name.clone()
        };

        if record.is_view {
            self.dest_ops
                .drop_view(&table)
                .await
                .map_err(|err| err.context(format!("drop view {table}")))?;
        } else if let Err(err) = self.dest_ops.drop_table(&table, true).await {
            if !err.message().contains("is not TABLE") {
                return Err(err.context(format!("drop table {table}")));
            }
            self.dest_ops
                .drop_view(&table)
                .await
                .map_err(|err| err.context(format!("drop view {table}")))?;
        }

        self.src_meta.clear_tables_cache();
        self.dest_meta.clear_tables_cache();
        self.progress.table_name_mapping.remove(&record.table_id);
        self.progress.table_mapping.remove(&record.table_id);
        Ok(())
    }

    async fn handle_dummy(&mut self, commit_seq: i64) -> Result<()> {
        let info = format!(
            "handle dummy binlog, need full sync. SyncType: {}, seq: {commit_seq}",
            self.info.sync_type
        );
        info!(job = %self.name(), "{info}");
        self.new_snapshot(commit_seq, &info).await
    }

    async fn handle_modify_property(&mut self, commit_seq: i64, data: &str) -> Result<()> {
        let record = ModifyTableProperty::from_json(data)?;
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }
        let dest_table = self.get_dest_name_by_src_id(record.table_id).await?;
        self.dest_ops.modify_table_property(&dest_table, &record).await
    }

    async fn handle_alter_job(&mut self, commit_seq: i64, data: &str) -> Result<()> {
        let record = AlterJobV2::from_json(data)?;
        if self.is_materialized_view_table(record.table_id).await? {
            warn!(job = %self.name(), table_id = record.table_id, "Skip alter job of materialized view");
            return Ok(());
        }
        if self.features().skip_rollup_binlogs && record.is_rollup() {
            warn!(job = %self.name(), job_id = record.job_id, "Skip rollup alter job");
            return Ok(());
        }

        if record.is_schema_change() {
            self.handle_schema_change(commit_seq, &record).await
        } else if record.is_rollup() {
            self.handle_alter_rollup(&record).await
        } else {
            Err(SyncError::normal(format!(
                "unsupported alter job type: {}",
                record.kind
            )))
        }
    }

    async fn handle_alter_rollup(&mut self, record: &AlterJobV2) -> Result<()> {
        if !record.is_finished() {
            if record.is_pending() {
                // Upserts may reach the rollup index before it exists downstream.
                self.progress
                    .shadow_indexes
                    .insert(record.rollup_index_id, record.base_index_id);
            } else if record.is_cancelled() {
                self.progress.shadow_indexes.remove(&record.rollup_index_id);
            }
            return Ok(());
        }

        self.progress.shadow_indexes.remove(&record.rollup_index_id);
        self.new_partial_snapshot(record.table_id, &record.table_name, Vec::new(), true)
            .await
    }

    async fn handle_schema_change(&mut self, commit_seq: i64, record: &AlterJobV2) -> Result<()> {
        if !record.is_finished() {
            if record.is_pending() {
                for (shadow, origin) in &record.shadow_indexes {
                    self.progress.shadow_indexes.insert(*shadow, *origin);
                }
            } else if record.is_cancelled() {
                for shadow in record.shadow_indexes.keys() {
                    self.progress.shadow_indexes.remove(shadow);
                }
            }
            return Ok(());
        }

        if self.features().schema_change_partial_sync {
            for shadow in record.shadow_indexes.keys() {
                self.progress.shadow_indexes.remove(shadow);
            }
            return self
                .new_partial_snapshot(record.table_id, &record.table_name, Vec::new(), true)
                .await;
        }

        let dest_table = self.dest_table_or(&record.table_name);
        self.drop_table_with_views(&dest_table).await?;

        let info = format!(
            "handle schema change job, need full sync, Table: {}",
            record.table_name
        );
        debug!(job = %self.name(), commit_seq, "{info}");
        let commit_seq = self.progress.commit_seq;
        self.new_snapshot(commit_seq, &info).await
    }

    /// Drop the views over `table`, then the table, retrying until both
    /// succeed or the job is stopped.
    async fn drop_table_with_views(&self, table: &str) -> Result<()> {
        let retry_delay = self.ctx.sync.persist_retry_delay();
        let mut views_dropped = false;
        loop {
            if !views_dropped {
                match self.dest_ops.get_all_views_from_table(table).await {
                    Ok(views) => {
                        let mut failed = false;
                        for view in &views {
                            if let Err(err) = self.dest_ops.drop_view(view).await {
                                error!(job = %self.name(), view = %view, error = %err, "Drop view failed");
                                failed = true;
                            }
                        }
                        views_dropped = !failed;
                    }
                    Err(err) => {
                        error!(job = %self.name(), table, error = %err, "Get views from table failed");
                    }
                }
            }

            if views_dropped {
                match self.dest_ops.drop_table(table, true).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        error!(job = %self.name(), table, error = %err, "Drop table failed");
                    }
                }
            }
            self.retry_backoff(retry_delay).await?;
        }
    }

    async fn handle_lightning_schema_change(&mut self, commit_seq: i64, data: &str) -> Result<()> {
        let record = ModifyTableAddOrDropColumns::from_json(data)?;
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }
        let alias = if self.info.is_table_sync_with_alias() {
            self.info.dest.table.as_str()
        } else {
            ""
        };
        self.dest_ops
            .lightning_schema_change(&self.info.src.database, alias, &record)
            .await
    }

    async fn handle_rename_column(&mut self, commit_seq: i64, record: RenameColumn) -> Result<()> {
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }
        let dest_table = self.get_dest_name_by_src_id(record.table_id).await?;
        self.dest_ops.rename_column(&dest_table, &record).await
    }

    async fn handle_modify_comment(&mut self, commit_seq: i64, record: ModifyComment) -> Result<()> {
        if self.is_binlog_committed(record.tbl_id, commit_seq) {
            return Ok(());
        }
        let dest_table = self.get_dest_name_by_src_id(record.tbl_id).await?;
        self.dest_ops.modify_comment(&dest_table, &record).await
    }

    async fn handle_truncate_table(&mut self, commit_seq: i64, data: &str) -> Result<()> {
        let record = TruncateTable::from_json(data)?;
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }

        let dest_table = self.dest_table_or(&record.table_name);
        self.dest_ops.truncate_table(&dest_table, &record).await?;
        self.src_meta
            .clear_table(&self.info.src.database, &record.table_name);
        self.dest_meta
            .clear_table(&self.info.dest.database, &dest_table);
        Ok(())
    }

    async fn handle_replace_partitions(&mut self, commit_seq: i64, data: &str) -> Result<()> {
        let record = ReplacePartition::from_json(data)?;
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }
        if self.is_materialized_view_table(record.table_id).await? {
            warn!(job = %self.name(), table_id = record.table_id, "Skip replace partitions of materialized view");
            return Ok(());
        }

        let unsupported = if !record.strict_range {
            Some("non strict range")
        } else if record.use_temp_name {
            Some("use tmp name")
        } else {
            None
        };
        if let Some(what) = unsupported {
            let info = format!(
                "replace partitions with {what} is not supported yet, replace partition record: {data}"
            );
            warn!(job = %self.name(), "{info}");
            let commit_seq = self.progress.commit_seq;
            return self.new_snapshot(commit_seq, &info).await;
        }

        info!(
            job = %self.name(),
            table = %record.table_name,
            partitions = %record.partitions.join(","),
            temp_partitions = %record.temp_partitions.join(","),
            "Replace partitions"
        );
        self.new_partial_snapshot(record.table_id, &record.table_name, record.partitions, false)
            .await
    }

    async fn handle_rename_table(&mut self, commit_seq: i64, mut record: RenameTable) -> Result<()> {
        if self.is_table_sync() {
            warn!(job = %self.name(), "Rename table is not supported when table sync");
            return Err(SyncError::normal(
                "rename table is not supported when table sync, consider rebuilding this job instead",
            ));
        }
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }
        if self.is_materialized_view_table(record.table_id).await? {
            warn!(job = %self.name(), table_id = record.table_id, "Skip rename of materialized view");
            return Ok(());
        }

        let dest_table = self.get_dest_name_by_src_id(record.table_id).await?;
        if !record.new_table_name.is_empty() && record.old_table_name.is_empty() {
            record.old_table_name = dest_table.clone();
        }
        self.dest_ops.rename_table(&dest_table, &record).await?;

        if let Err(err) = self.dest_meta.get_tables().await {
            warn!(job = %self.name(), error = %err, "Refresh dest tables failed");
        }
        self.progress
            .table_name_mapping
            .insert(record.table_id, record.new_table_name);
        Ok(())
    }

    async fn handle_replace_table(&mut self, commit_seq: i64, record: ReplaceTable) -> Result<()> {
        if self.is_table_sync() {
            let info = format!(
                "replace table {} with fullsync in table sync, reset src table id from {} to {}, swap: {}",
                record.origin_table_name, record.origin_table_id, record.new_table_id, record.swap_table
            );
            info!(job = %self.name(), "{info}");
            self.info.src.table_id = record.new_table_id;
            self.persist_job().await?;
            return self.new_snapshot(commit_seq, &info).await;
        }

        if self.is_materialized_view_table(record.origin_table_id).await? {
            warn!(job = %self.name(), table_id = record.origin_table_id, "Skip replace of materialized view");
            return Ok(());
        }

        if self.progress.sync_state == SyncState::DbTablesIncrementalSync {
            let synced = |table_id: i64| {
                self.progress
                    .table_commit_seq_map
                    .as_ref()
                    .and_then(|seq_map| seq_map.get(&table_id).copied())
                    .unwrap_or(0)
                    >= commit_seq
            };
            let origin_synced = synced(record.origin_table_id);
            let new_synced = synced(record.new_table_id);
            match (origin_synced, new_synced, record.swap_table) {
                (true, true, _) | (true, false, false) | (false, true, false) => {
                    info!(
                        job = %self.name(),
                        origin = %record.origin_table_name,
                        new = %record.new_table_name,
                        commit_seq,
                        "Filter replace table binlog, already synced"
                    );
                    return Ok(());
                }
                (true, false, true) => {
                    return self
                        .new_partial_snapshot(
                            record.new_table_id,
                            &record.origin_table_name,
                            Vec::new(),
                            false,
                        )
                        .await;
                }
                (false, true, true) => {
                    return self
                        .new_partial_snapshot(
                            record.origin_table_id,
                            &record.new_table_name,
                            Vec::new(),
                            false,
                        )
                        .await;
                }
                (false, false, _) => {}
            }
        }

        self.dest_ops
            .replace_table(&record.new_table_name, &record.origin_table_name, record.swap_table)
            .await?;
        if let Err(err) = self.dest_meta.get_tables().await {
            warn!(job = %self.name(), error = %err, "Refresh dest tables failed");
        }

        let names = &mut self.progress.table_name_mapping;
        if record.swap_table {
            names.insert(record.origin_table_id, record.new_table_name);
            names.insert(record.new_table_id, record.origin_table_name);
        } else {
            names.insert(record.new_table_id, record.origin_table_name);
            names.remove(&record.origin_table_id);
            self.progress.table_mapping.remove(&record.origin_table_id);
        }
        Ok(())
    }

    async fn handle_inverted_indices(
        &mut self,
        commit_seq: i64,
        record: ModifyTableAddOrDropInvertedIndices,
    ) -> Result<()> {
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }

        if record.is_drop_inverted_index {
            let dest_table = self.get_dest_name_by_src_id(record.table_id).await?;
            return self.dest_ops.lightning_index_change(&dest_table, &record).await;
        }

        // Index ids must match upstream, so rebuild the table by a partial snapshot.
        let table = if self.is_table_sync() {
            self.info.src.table.clone()
        } else {
            self.get_dest_name_by_src_id(record.table_id)
                .await
                .map_err(|err| {
                    SyncError::normal(format!(
                        "get dest table name by src id {} failed, err: {err}",
                        record.table_id
                    ))
                })?
        };
        self.new_partial_snapshot(record.table_id, &table, Vec::new(), true)
            .await
    }

    async fn handle_index_change_job(&mut self, commit_seq: i64, record: IndexChangeJob) -> Result<()> {
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }
        if !record.is_finished() || record.is_drop_op {
            debug!(
                job = %self.name(),
                job_state = %record.job_state,
                is_drop_op = record.is_drop_op,
                "Skip index change job"
            );
            return Ok(());
        }

        let dest_table = self.dest_table_or(&record.table_name);
        self.dest_ops.build_index(&dest_table, &record).await
    }

    async fn handle_alter_view_def(&mut self, commit_seq: i64, record: AlterView) -> Result<()> {
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }
        let view = self.get_dest_name_by_src_id(record.table_id).await?;
        self.dest_ops
            .alter_view_def(&self.info.src.database, &view, &record)
            .await
    }

    /// Table name for a partial snapshot replacing the table behind `dest_table`.
    fn partial_table_name(&self, dest_table: String) -> String {
        if self.info.is_table_sync_with_alias() {
            self.info.src.table.clone()
        } else {
            dest_table
        }
    }

    async fn handle_rename_partition(&mut self, commit_seq: i64, record: RenamePartition) -> Result<()> {
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }

        let dest_table = self.get_dest_name_by_src_id(record.table_id).await?;
        if record.old_partition_name.is_empty() {
            warn!(
                job = %self.name(),
                new_partition = %record.new_partition_name,
                partition_id = record.partition_id,
                table_id = record.table_id,
                commit_seq,
                "Old partition name is empty, sync partition via partial snapshot"
            );
            let table = self.partial_table_name(dest_table);
            return self
                .new_partial_snapshot(record.table_id, &table, Vec::new(), true)
                .await;
        }
        self.dest_ops
            .rename_partition(&dest_table, &record.old_partition_name, &record.new_partition_name)
            .await
    }

    async fn handle_rename_rollup(&mut self, commit_seq: i64, record: RenameRollup) -> Result<()> {
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }

        let dest_table = self.get_dest_name_by_src_id(record.table_id).await?;
        if record.old_rollup_name.is_empty() {
            warn!(
                job = %self.name(),
                new_rollup = %record.new_rollup_name,
                index_id = record.index_id,
                table_id = record.table_id,
                commit_seq,
                "Old rollup name is empty, sync rollup via partial snapshot"
            );
            let table = self.partial_table_name(dest_table);
            return self
                .new_partial_snapshot(record.table_id, &table, Vec::new(), true)
                .await;
        }
        self.dest_ops
            .rename_rollup(&dest_table, &record.old_rollup_name, &record.new_rollup_name)
            .await
    }

    async fn handle_drop_rollup(&mut self, commit_seq: i64, record: DropRollup) -> Result<()> {
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }
        let dest_table = self.dest_table_or(&record.table_name);
        self.dest_ops.drop_rollup(&dest_table, &record.index_name).await
    }

    async fn handle_recover_info(&mut self, commit_seq: i64, record: RecoverInfo) -> Result<()> {
        if self.is_binlog_committed(record.table_id, commit_seq) {
            return Ok(());
        }

        if record.is_recover_table() {
            let table = if record.new_table_name.is_empty() {
                &record.table_name
            } else {
                &record.new_table_name
            };
            info!(job = %self.name(), table = %table, "Recover table, trigger partial sync");
            return self
                .new_partial_snapshot(record.table_id, table, Vec::new(), true)
                .await;
        }

        let partition = if record.new_partition_name.is_empty() {
            &record.partition_name
        } else {
            &record.new_partition_name
        };
        // The whole table is replaced; several recoveries in a row may race with the snapshot.
        info!(
            job = %self.name(),
            table = %record.table_name,
            partition = %partition,
            "Recover partition, trigger partial sync"
        );
        self.new_partial_snapshot(record.table_id, &record.table_name, Vec::new(), true)
            .await
    }

    async fn handle_barrier(&mut self, commit_seq: i64, data: &str) -> Result<()> {
        let barrier = BarrierLog::from_json(data)?;
        if barrier.binlog.is_empty() {
            info!(job = %self.name(), "Ignore barrier binlog");
            return Ok(());
        }

        let inner = barrier.binlog.as_str();
        let binlog_type = BinlogType::from_wire(barrier.binlog_type);
        info!(
            job = %self.name(),
            binlog_type = %binlog_type,
            prev_commit_seq = self.progress.prev_commit_seq,
            commit_seq,
            "Handle barrier binlog"
        );
        match binlog_type {
            BinlogType::RenameTable => {
                self.handle_rename_table(commit_seq, RenameTable::from_json(inner)?).await
            }
            BinlogType::RenameColumn => {
                self.handle_rename_column(commit_seq, RenameColumn::from_json(inner)?).await
            }
            BinlogType::RenamePartition => {
                self.handle_rename_partition(commit_seq, RenamePartition::from_json(inner)?)
                    .await
            }
            BinlogType::RenameRollup => {
                self.handle_rename_rollup(commit_seq, RenameRollup::from_json(inner)?).await
            }
            BinlogType::DropRollup => {
                self.handle_drop_rollup(commit_seq, DropRollup::from_json(inner)?).await
            }
            BinlogType::ReplaceTable => {
                self.handle_replace_table(commit_seq, ReplaceTable::from_json(inner)?).await
            }
            BinlogType::ModifyTableAddOrDropInvertedIndices => {
                let record = ModifyTableAddOrDropInvertedIndices::from_json(inner)?;
                self.handle_inverted_indices(commit_seq, record).await
            }
            BinlogType::IndexChangeJob => {
                self.handle_index_change_job(commit_seq, IndexChangeJob::from_json(inner)?)
                    .await
            }
            BinlogType::ModifyViewDef => {
                self.handle_alter_view_def(commit_seq, AlterView::from_json(inner)?).await
            }
            BinlogType::ModifyComment => {
                self.handle_modify_comment(commit_seq, ModifyComment::from_json(inner)?).await
            }
            BinlogType::RecoverInfo => {
                self.handle_recover_info(commit_seq, RecoverInfo::from_json(inner)?).await
            }
            BinlogType::Barrier => {
                info!(job = %self.name(), "Ignore barrier binlog");
                Ok(())
            }
            _ => Err(SyncError::normal(format!(
                "unknown binlog type wrapped by barrier: {}",
                barrier.binlog_type
            ))),
        }
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ensure, parse};
use crate::error::Result;

pub const ALTER_JOB_SCHEMA_CHANGE: &str = "SCHEMA_CHANGE";
pub const ALTER_JOB_ROLLUP: &str = "ROLLUP";

pub const ALTER_JOB_STATE_PENDING: &str = "PENDING";
pub const ALTER_JOB_STATE_FINISHED: &str = "FINISHED";
pub const ALTER_JOB_STATE_CANCELLED: &str = "CANCELLED";

pub const INDEX_CHANGE_JOB_STATE_FINISHED: &str = "FINISHED";

pub const INDEX_TYPE_INVERTED: &str = "INVERTED";

/// Schema change or rollup job reported by the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlterJobV2 {
    #[serde(rename = "type")]
    pub kind: String,
    pub db_id: i64,
    pub table_id: i64,
    pub table_name: String,
    pub job_id: i64,
    pub job_state: String,
    pub raw_sql: String,
    /// Shadow index id to origin index id.
    #[serde(rename = "iim")]
    pub shadow_indexes: BTreeMap<i64, i64>,
    pub rollup_index_id: i64,
    pub rollup_index_name: String,
    pub base_index_id: i64,
    pub base_index_name: String,
}

impl AlterJobV2 {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: AlterJobV2 = parse(data, "alter job")?;
        ensure(record.table_id != 0, "invalid alter job, table id not found")?;
        ensure(
            !record.table_name.is_empty(),
            "invalid alter job, tableName is empty",
        )?;
        Ok(record)
    }

    pub fn is_schema_change(&self) -> bool {
        self.kind == ALTER_JOB_SCHEMA_CHANGE
    }

    pub fn is_rollup(&self) -> bool {
        self.kind == ALTER_JOB_ROLLUP
    }

    pub fn is_pending(&self) -> bool {
        self.job_state == ALTER_JOB_STATE_PENDING
    }

    pub fn is_finished(&self) -> bool {
        self.job_state == ALTER_JOB_STATE_FINISHED
    }

    pub fn is_cancelled(&self) -> bool {
        self.job_state == ALTER_JOB_STATE_CANCELLED
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DropRollup {
    pub db_id: i64,
    pub table_id: i64,
    pub table_name: String,
    pub index_id: i64,
    pub index_name: String,
}

impl DropRollup {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: DropRollup = parse(data, "drop rollup")?;
        ensure(record.table_id != 0, "invalid drop rollup, table id not found")?;
        ensure(
            !record.table_name.is_empty(),
            "invalid drop rollup, tableName is empty",
        )?;
        ensure(
            !record.index_name.is_empty(),
            "invalid drop rollup, indexName is empty",
        )?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenameRollup {
    #[serde(rename = "db")]
    pub db_id: i64,
    #[serde(rename = "tb")]
    pub table_id: i64,
    #[serde(rename = "ind")]
    pub index_id: i64,
    #[serde(rename = "nR")]
    pub new_rollup_name: String,
    #[serde(rename = "oR")]
    pub old_rollup_name: String,
}

impl RenameRollup {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: RenameRollup = parse(data, "rename rollup record")?;
        ensure(record.table_id != 0, "rename rollup record table id not found")?;
        ensure(
            !record.new_rollup_name.is_empty(),
            "rename rollup record new rollup name not found",
        )?;
        Ok(record)
    }
}

/// Secondary index definition. Newer sources emit abbreviated keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Index {
    #[serde(rename = "indexId", alias = "i")]
    pub index_id: i64,
    #[serde(rename = "indexName", alias = "in")]
    pub index_name: String,
    #[serde(alias = "c")]
    pub columns: Vec<String>,
    #[serde(rename = "indexType", alias = "it")]
    pub index_type: String,
    #[serde(alias = "pt")]
    pub properties: BTreeMap<String, String>,
    #[serde(alias = "ct")]
    pub comment: String,
    #[serde(rename = "columnUniqueIds", alias = "cui")]
    pub column_unique_ids: Vec<i32>,
}

impl Index {
    pub fn is_inverted_index(&self) -> bool {
        self.index_type == INDEX_TYPE_INVERTED
    }
}

/// Build or drop of an inverted index on one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IndexChangeJob {
    pub db_id: i64,
    pub table_id: i64,
    pub table_name: String,
    pub partition_id: i64,
    pub partition_name: String,
    pub job_state: String,
    pub err_msg: String,
    pub create_time_ms: i64,
    pub finished_time_ms: i64,
    pub is_drop_op: bool,
    pub origin_index_id: i64,
    pub timeout_ms: i64,
    #[serde(rename = "alterInvertedIndexes")]
    pub indexes: Vec<Index>,
}

impl IndexChangeJob {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: IndexChangeJob = parse(data, "index change job")?;
        ensure(record.table_id != 0, "index change job table id not found")?;
        ensure(
            record.partition_id != 0,
            "index change job partition id not found",
        )?;
        ensure(!record.job_state.is_empty(), "index change job state not found")?;
        ensure(
            !record.indexes.is_empty(),
            "index change job alter inverted indexes is empty",
        )?;
        ensure(
            record.is_drop_op || record.indexes.len() == 1,
            "index change job alter inverted indexes length is not 1",
        )?;
        Ok(record)
    }

    pub fn is_finished(&self) -> bool {
        self.job_state == INDEX_CHANGE_JOB_STATE_FINISHED
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnType {
    #[serde(rename = "type")]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// Light-weight column add/drop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModifyTableAddOrDropColumns {
    pub db_id: i64,
    pub table_id: i64,
    pub raw_sql: String,
    pub index_schema_map: BTreeMap<i64, Vec<ColumnSchema>>,
}

impl ModifyTableAddOrDropColumns {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: ModifyTableAddOrDropColumns =
            parse(data, "modify table add or drop columns")?;
        ensure(
            !record.raw_sql.is_empty(),
            "modify table add or drop columns sql is empty",
        )?;
        ensure(record.table_id != 0, "table id not found")?;
        Ok(record)
    }
}

/// Light-weight inverted index add/drop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModifyTableAddOrDropInvertedIndices {
    pub db_id: i64,
    pub table_id: i64,
    pub is_drop_inverted_index: bool,
    pub raw_sql: String,
    pub indexes: Vec<Index>,
    #[serde(rename = "alterInvertedIndexes")]
    pub alternative_indexes: Vec<Index>,
}

impl ModifyTableAddOrDropInvertedIndices {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: ModifyTableAddOrDropInvertedIndices =
            parse(data, "modify table add or drop inverted indices")?;
        ensure(
            !record.raw_sql.is_empty(),
            "modify table add or drop inverted indices sql is empty",
        )?;
        ensure(
            record.table_id != 0,
            "modify table add or drop inverted indices table id not found",
        )?;
        Ok(record)
    }

    /// Older sources log `ALTER TABLE t INDEX ...` without the `ADD` keyword.
    pub fn raw_sql(&self) -> String {
        let sql = &self.raw_sql;
        if sql.contains("ALTER TABLE")
            && sql.contains("INDEX")
            && !sql.contains("DROP INDEX")
            && !sql.contains("ADD INDEX")
        {
            sql.replace("INDEX", "ADD INDEX")
        } else {
            sql.clone()
        }
    }
}

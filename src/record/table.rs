use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{TableType, ensure, parse};
use crate::error::Result;

static CREATE_VIEW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^CREATE(\s+)VIEW").expect("static regex"));
static INVERTED_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"INDEX (.*?) USING INVERTED").expect("static regex"));
static STORAGE_MEDIUM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""storage_medium"\s*=\s*"[^"]*"(,\s*)?"#).expect("static regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateTable {
    pub db_id: i64,
    pub table_id: i64,
    pub sql: String,
    pub db_name: String,
    pub table_name: String,
    /// Absent from payloads emitted by older sources.
    pub table_type: Option<TableType>,
}

impl CreateTable {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: CreateTable = parse(data, "create table")?;
        ensure(!record.sql.is_empty(), "create table sql is empty")?;
        ensure(record.table_id != 0, "table id not found")?;
        Ok(record)
    }

    pub fn is_create_view(&self) -> bool {
        CREATE_VIEW.is_match(&self.sql)
    }

    pub fn is_create_table_with_inverted_index(&self) -> bool {
        INVERTED_INDEX.is_match(&self.sql)
    }

    /// Asynchronous materialized views are not replicated.
    pub fn is_create_materialized_view(&self) -> bool {
        self.table_type == Some(TableType::MaterializedView)
            || self.sql.contains("ENGINE=MATERIALIZED_VIEW")
    }

    /// Removes `"storage_medium" = "..."` so the destination picks its own medium.
    pub fn strip_storage_medium(&mut self) {
        self.sql = STORAGE_MEDIUM.replace_all(&self.sql, "").into_owned();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DropTable {
    pub db_id: i64,
    pub table_id: i64,
    pub table_name: String,
    pub is_view: bool,
    pub raw_sql: String,
}

impl DropTable {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: DropTable = parse(data, "drop table")?;
        ensure(record.table_id != 0, "table id not found")?;
        Ok(record)
    }
}

/// Rename of a table; the same payload shape carries rollup and partition names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenameTable {
    #[serde(rename = "db")]
    pub db_id: i64,
    #[serde(rename = "tb")]
    pub table_id: i64,
    #[serde(rename = "ind")]
    pub index_id: i64,
    #[serde(rename = "p")]
    pub partition_id: i64,
    #[serde(rename = "nT")]
    pub new_table_name: String,
    #[serde(rename = "oT")]
    pub old_table_name: String,
    #[serde(rename = "nR")]
    pub new_rollup_name: String,
    #[serde(rename = "oR")]
    pub old_rollup_name: String,
    #[serde(rename = "nP")]
    pub new_partition_name: String,
    #[serde(rename = "oP")]
    pub old_partition_name: String,
}

impl RenameTable {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: RenameTable = parse(data, "rename table")?;
        ensure(record.table_id != 0, "table id not found")?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaceTable {
    #[serde(rename = "dbId")]
    pub db_id: i64,
    #[serde(rename = "origTblId")]
    pub origin_table_id: i64,
    #[serde(rename = "origTblName")]
    pub origin_table_name: String,
    // The source emits the new table id under this key.
    #[serde(rename = "newTblName")]
    pub new_table_id: i64,
    #[serde(rename = "actualNewTblName")]
    pub new_table_name: String,
    #[serde(rename = "swapTable")]
    pub swap_table: bool,
    #[serde(rename = "isForce")]
    pub is_force: bool,
}

impl ReplaceTable {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: ReplaceTable = parse(data, "replace table record")?;
        ensure(
            record.origin_table_id != 0,
            "table id of replace table record not found",
        )?;
        ensure(
            !record.origin_table_name.is_empty(),
            "table name of replace table record not found",
        )?;
        ensure(
            record.new_table_id != 0,
            "new table id of replace table record not found",
        )?;
        ensure(
            !record.new_table_name.is_empty(),
            "new table name of replace table record not found",
        )?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncateTable {
    #[serde(rename = "dbId")]
    pub db_id: i64,
    #[serde(rename = "db")]
    pub db_name: String,
    #[serde(rename = "tblId")]
    pub table_id: i64,
    #[serde(rename = "table")]
    pub table_name: String,
    #[serde(rename = "isEntireTable")]
    pub is_entire_table: bool,
    #[serde(rename = "rawSql")]
    pub raw_sql: String,
}

impl TruncateTable {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: TruncateTable = parse(data, "truncate table")?;
        ensure(record.table_id != 0, "table id not found")?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlterView {
    pub db_id: i64,
    pub table_id: i64,
    pub inline_view_def: String,
    pub sql_mode: i64,
}

impl AlterView {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: AlterView = parse(data, "alter view")?;
        ensure(record.table_id != 0, "table id not found")?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModifyComment {
    #[serde(rename = "type")]
    pub kind: String,
    pub db_id: i64,
    pub tbl_id: i64,
    pub col_to_comment: BTreeMap<String, String>,
    pub tbl_comment: String,
}

impl ModifyComment {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: ModifyComment = parse(data, "modify comment")?;
        ensure(record.tbl_id != 0, "table id not found")?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModifyTableProperty {
    pub db_id: i64,
    pub table_id: i64,
    pub table_name: String,
    pub properties: BTreeMap<String, String>,
    pub sql: String,
}

impl ModifyTableProperty {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: ModifyTableProperty = parse(data, "modify table property")?;
        ensure(record.table_id != 0, "table id not found")?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenameColumn {
    pub db_id: i64,
    pub table_id: i64,
    pub col_name: String,
    pub new_col_name: String,
    pub index_id_to_schema_version: BTreeMap<i64, i32>,
}

impl RenameColumn {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: RenameColumn = parse(data, "rename column")?;
        ensure(record.table_id != 0, "table id not found")?;
        Ok(record)
    }
}

/// Recovery of a table or partition from the source's recycle bin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoverInfo {
    pub db_id: i64,
    pub new_db_name: String,
    pub table_id: i64,
    pub table_name: String,
    pub new_table_name: String,
    pub partition_id: i64,
    pub partition_name: String,
    pub new_partition_name: String,
}

impl RecoverInfo {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: RecoverInfo = parse(data, "recover info")?;
        ensure(record.table_id != 0, "table id not found")?;
        ensure(!record.table_name.is_empty(), "Table Name can not be null")?;
        Ok(record)
    }

    pub fn is_recover_table(&self) -> bool {
        self.partition_name.is_empty() || self.partition_id == -1
    }
}

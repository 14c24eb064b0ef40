use serde::{Deserialize, Serialize};

use super::{ensure, parse};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddPartition {
    #[serde(rename = "dbId")]
    pub db_id: i64,
    #[serde(rename = "tableId")]
    pub table_id: i64,
    pub sql: String,
    #[serde(rename = "isTempPartition")]
    pub is_temp: bool,
}

impl AddPartition {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: AddPartition = parse(data, "add partition")?;
        ensure(!record.sql.is_empty(), "add partition sql is empty")?;
        ensure(record.table_id != 0, "table id not found")?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropPartition {
    #[serde(rename = "tableId")]
    pub table_id: i64,
    pub sql: String,
    #[serde(rename = "isTempPartition")]
    pub is_temp: bool,
}

impl DropPartition {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: DropPartition = parse(data, "drop partition")?;
        ensure(!record.sql.is_empty(), "drop partition sql is empty")?;
        ensure(record.table_id != 0, "table id not found")?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenamePartition {
    #[serde(rename = "db")]
    pub db_id: i64,
    #[serde(rename = "tb")]
    pub table_id: i64,
    #[serde(rename = "p")]
    pub partition_id: i64,
    #[serde(rename = "nP")]
    pub new_partition_name: String,
    #[serde(rename = "oP")]
    pub old_partition_name: String,
}

impl RenamePartition {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: RenamePartition = parse(data, "rename partition record")?;
        ensure(
            record.table_id != 0,
            "rename partition record table id not found",
        )?;
        ensure(
            record.partition_id != 0,
            "rename partition record partition id not found",
        )?;
        ensure(
            !record.new_partition_name.is_empty(),
            "rename partition record new partition name not found",
        )?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplacePartition {
    #[serde(rename = "dbId")]
    pub db_id: i64,
    #[serde(rename = "dbName")]
    pub db_name: String,
    #[serde(rename = "tblId")]
    pub table_id: i64,
    #[serde(rename = "tblName")]
    pub table_name: String,
    pub partitions: Vec<String>,
    #[serde(rename = "tempPartitions")]
    pub temp_partitions: Vec<String>,
    #[serde(rename = "strictRange")]
    pub strict_range: bool,
    #[serde(rename = "useTempPartitionName")]
    pub use_temp_name: bool,
}

impl ReplacePartition {
    pub fn from_json(data: &str) -> Result<Self> {
        let record: ReplacePartition = parse(data, "replace partition")?;
        ensure(
            !record.temp_partitions.is_empty(),
            "the temp partitions of the replace partition record is empty",
        )?;
        ensure(record.table_id != 0, "table id not found")?;
        ensure(!record.table_name.is_empty(), "table name is empty")?;
        Ok(record)
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::parse;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionRecord {
    #[serde(rename = "partitionId")]
    pub id: i64,
    pub range: String,
    pub version: i64,
    #[serde(rename = "isTempPartition")]
    pub is_temp: bool,
    /// Sub-transaction id of a multi-statement insert, 0 otherwise.
    pub stid: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TableRecord {
    /// Filled from the `tableRecords` key after parsing.
    pub id: i64,
    pub partition_records: Vec<PartitionRecord>,
    pub index_ids: Vec<i64>,
}

/// Data change of one committed source transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Upsert {
    pub commit_seq: i64,
    pub txn_id: i64,
    pub time_stamp: i64,
    pub label: String,
    pub db_id: i64,
    pub table_records: BTreeMap<i64, TableRecord>,
    pub stids: Vec<i64>,
}

impl Upsert {
    pub fn from_json(data: &str) -> Result<Self> {
        let mut upsert: Upsert = parse(data, "upsert")?;
        for (table_id, record) in upsert.table_records.iter_mut() {
            record.id = *table_id;
        }
        Ok(upsert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ids_come_from_map_keys() {
        let data = r#"{
            "commitSeq": 949780,
            "txnId": 18019,
            "label": "insert_334a873c",
            "dbId": 10116,
            "tableRecords": {
                "21012": {"partitionRecords": [{"partitionId": 21011, "range": "[]", "version": 9}]}
            }
        }"#;

        let upsert = Upsert::from_json(data).unwrap();
        let record = &upsert.table_records[&21012];
        assert_eq!(record.id, 21012);
        assert_eq!(record.partition_records[0].version, 9);
        assert!(!record.partition_records[0].is_temp);
        assert!(upsert.stids.is_empty());
    }
}

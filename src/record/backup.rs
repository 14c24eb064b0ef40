use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, SyncError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupViewInfo {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOlapTableInfo {
    #[serde(default)]
    pub id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBackupObject {
    #[serde(default)]
    pub views: Vec<BackupViewInfo>,
}

/// The part of a snapshot's job info the syncer reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJobInfo {
    #[serde(default)]
    pub table_commit_seq_map: Option<HashMap<i64, i64>>,
    #[serde(default)]
    pub backup_objects: BTreeMap<String, BackupOlapTableInfo>,
    #[serde(default)]
    pub new_backup_objects: Option<NewBackupObject>,
}

impl BackupJobInfo {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| SyncError::wrap(ErrorKind::Normal, "unmarshal job info error", e))
    }

    /// Source table id to table name.
    pub fn table_name_mapping(&self) -> HashMap<i64, String> {
        self.backup_objects
            .iter()
            .map(|(name, info)| (info.id, name.clone()))
            .collect()
    }

    /// Table id by name, -1 when the table is not part of the backup.
    pub fn table_id(&self, name: &str) -> i64 {
        self.backup_objects.get(name).map(|info| info.id).unwrap_or(-1)
    }

    pub fn views(&self) -> Vec<String> {
        self.new_backup_objects
            .as_ref()
            .map(|objects| objects.views.iter().map(|v| v.name.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_tables_and_views() {
        let data = br#"{
            "table_commit_seq_map": {"100": 15, "101": 16},
            "backup_objects": {"t1": {"id": 100}, "t2": {"id": 101}},
            "new_backup_objects": {"views": [{"id": 200, "name": "v1"}]}
        }"#;

        let info = BackupJobInfo::from_json(data).unwrap();
        assert_eq!(info.table_id("t2"), 101);
        assert_eq!(info.table_id("missing"), -1);
        assert_eq!(info.table_name_mapping()[&100], "t1");
        assert_eq!(info.views(), vec!["v1".to_string()]);
        assert_eq!(info.table_commit_seq_map.unwrap()[&101], 16);
    }
}

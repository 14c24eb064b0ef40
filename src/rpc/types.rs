//! Request and response shapes exchanged with cluster frontends and backends.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status code returned by remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    #[default]
    Ok,
    SnapshotNotExist,
    SnapshotExpired,
    BinlogTooOldCommitSeq,
    BinlogTooNewCommitSeq,
    BinlogDisable,
    BinlogNotFoundDb,
    BinlogNotFoundTable,
    PublishTimeout,
    Other(i32),
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Ok => f.write_str("OK"),
            StatusCode::SnapshotNotExist => f.write_str("SNAPSHOT_NOT_EXIST"),
            StatusCode::SnapshotExpired => f.write_str("SNAPSHOT_EXPIRED"),
            StatusCode::BinlogTooOldCommitSeq => f.write_str("BINLOG_TOO_OLD_COMMIT_SEQ"),
            StatusCode::BinlogTooNewCommitSeq => f.write_str("BINLOG_TOO_NEW_COMMIT_SEQ"),
            StatusCode::BinlogDisable => f.write_str("BINLOG_DISABLE"),
            StatusCode::BinlogNotFoundDb => f.write_str("BINLOG_NOT_FOUND_DB"),
            StatusCode::BinlogNotFoundTable => f.write_str("BINLOG_NOT_FOUND_TABLE"),
            StatusCode::PublishTimeout => f.write_str("PUBLISH_TIMEOUT"),
            StatusCode::Other(code) => write!(f, "STATUS_{code}"),
        }
    }
}

/// Status of a remote call: a code plus free-text messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Status {
    pub code: StatusCode,
    #[serde(default)]
    pub error_msgs: Vec<String>,
}

impl Status {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error<S: Into<String>>(code: StatusCode, message: S) -> Self {
        Self {
            code,
            error_msgs: vec![message.into()],
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Whether any error message contains any of the patterns.
    pub fn contains_any(&self, patterns: &[&str]) -> bool {
        self.error_msgs
            .iter()
            .any(|msg| patterns.iter().any(|p| msg.contains(p)))
    }

    pub fn first_message(&self) -> &str {
        self.error_msgs.first().map(String::as_str).unwrap_or("unknown")
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error_msgs.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.error_msgs.join("; "))
        }
    }
}

/// Type tag of a changelog entry, with the source's wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinlogType {
    Upsert,
    AddPartition,
    CreateTable,
    DropPartition,
    DropTable,
    AlterJob,
    ModifyTableAddOrDropColumns,
    Dummy,
    AlterDatabaseProperty,
    ModifyTableProperty,
    Barrier,
    ModifyPartitions,
    ReplacePartitions,
    TruncateTable,
    RenameTable,
    RenameColumn,
    ModifyComment,
    ModifyViewDef,
    ReplaceTable,
    ModifyTableAddOrDropInvertedIndices,
    IndexChangeJob,
    RenameRollup,
    RenamePartition,
    DropRollup,
    RecoverInfo,
    Unknown(i64),
}

impl BinlogType {
    pub fn from_wire(value: i64) -> Self {
        match value {
            0 => BinlogType::Upsert,
            1 => BinlogType::AddPartition,
            2 => BinlogType::CreateTable,
            3 => BinlogType::DropPartition,
            4 => BinlogType::DropTable,
            5 => BinlogType::AlterJob,
            6 => BinlogType::ModifyTableAddOrDropColumns,
            7 => BinlogType::Dummy,
            8 => BinlogType::AlterDatabaseProperty,
            9 => BinlogType::ModifyTableProperty,
            10 => BinlogType::Barrier,
            11 => BinlogType::ModifyPartitions,
            12 => BinlogType::ReplacePartitions,
            13 => BinlogType::TruncateTable,
            14 => BinlogType::RenameTable,
            15 => BinlogType::RenameColumn,
            16 => BinlogType::ModifyComment,
            17 => BinlogType::ModifyViewDef,
            18 => BinlogType::ReplaceTable,
            19 => BinlogType::ModifyTableAddOrDropInvertedIndices,
            20 => BinlogType::IndexChangeJob,
            21 => BinlogType::RenameRollup,
            22 => BinlogType::RenamePartition,
            23 => BinlogType::DropRollup,
            24 => BinlogType::RecoverInfo,
            other => BinlogType::Unknown(other),
        }
    }

    pub fn to_wire(self) -> i64 {
        match self {
            BinlogType::Upsert => 0,
            BinlogType::AddPartition => 1,
            BinlogType::CreateTable => 2,
            BinlogType::DropPartition => 3,
            BinlogType::DropTable => 4,
            BinlogType::AlterJob => 5,
            BinlogType::ModifyTableAddOrDropColumns => 6,
            BinlogType::Dummy => 7,
            BinlogType::AlterDatabaseProperty => 8,
            BinlogType::ModifyTableProperty => 9,
            BinlogType::Barrier => 10,
            BinlogType::ModifyPartitions => 11,
            BinlogType::ReplacePartitions => 12,
            BinlogType::TruncateTable => 13,
            BinlogType::RenameTable => 14,
            BinlogType::RenameColumn => 15,
            BinlogType::ModifyComment => 16,
            BinlogType::ModifyViewDef => 17,
            BinlogType::ReplaceTable => 18,
            BinlogType::ModifyTableAddOrDropInvertedIndices => 19,
            BinlogType::IndexChangeJob => 20,
            BinlogType::RenameRollup => 21,
            BinlogType::RenamePartition => 22,
            BinlogType::DropRollup => 23,
            BinlogType::RecoverInfo => 24,
            BinlogType::Unknown(other) => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BinlogType::Upsert => "upsert",
            BinlogType::AddPartition => "add_partition",
            BinlogType::CreateTable => "create_table",
            BinlogType::DropPartition => "drop_partition",
            BinlogType::DropTable => "drop_table",
            BinlogType::AlterJob => "alter_job",
            BinlogType::ModifyTableAddOrDropColumns => "modify_table_add_or_drop_columns",
            BinlogType::Dummy => "dummy",
            BinlogType::AlterDatabaseProperty => "alter_database_property",
            BinlogType::ModifyTableProperty => "modify_table_property",
            BinlogType::Barrier => "barrier",
            BinlogType::ModifyPartitions => "modify_partitions",
            BinlogType::ReplacePartitions => "replace_partitions",
            BinlogType::TruncateTable => "truncate_table",
            BinlogType::RenameTable => "rename_table",
            BinlogType::RenameColumn => "rename_column",
            BinlogType::ModifyComment => "modify_comment",
            BinlogType::ModifyViewDef => "modify_view_def",
            BinlogType::ReplaceTable => "replace_table",
            BinlogType::ModifyTableAddOrDropInvertedIndices => {
                "modify_table_add_or_drop_inverted_indices"
            }
            BinlogType::IndexChangeJob => "index_change_job",
            BinlogType::RenameRollup => "rename_rollup",
            BinlogType::RenamePartition => "rename_partition",
            BinlogType::DropRollup => "drop_rollup",
            BinlogType::RecoverInfo => "recover_info",
            BinlogType::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for BinlogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinlogType::Unknown(value) => write!(f, "unknown({value})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One changelog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binlog {
    pub commit_seq: i64,
    pub binlog_type: BinlogType,
    pub data: String,
}

impl Binlog {
    pub fn new<S: Into<String>>(commit_seq: i64, binlog_type: BinlogType, data: S) -> Self {
        Self {
            commit_seq,
            binlog_type,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetBinlogResponse {
    pub status: Status,
    pub binlogs: Vec<Binlog>,
}

#[derive(Debug, Clone, Default)]
pub struct BeginTxnResponse {
    pub status: Status,
    pub txn_id: i64,
    pub db_id: i64,
    /// Sub transaction ids, only for transactional multi-statement inserts.
    pub sub_txn_ids: Vec<i64>,
}

/// Acknowledgement that one destination replica holds the ingested data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabletCommitInfo {
    pub tablet_id: i64,
    pub backend_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTxnInfo {
    pub sub_txn_id: i64,
    pub table_id: i64,
    pub tablet_commit_infos: Vec<TabletCommitInfo>,
}

/// Result of fetching a finished snapshot from the source.
///
/// The binary blobs are base64 encoded when the result is serialized into
/// progress checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SnapshotResult {
    #[serde(default)]
    pub status: Status,
    #[serde(default, with = "base64_bytes")]
    pub meta: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub job_info: Vec<u8>,
    /// Expiry instant in unix millis, zero when unknown.
    #[serde(default)]
    pub expired_at: i64,
    #[serde(default)]
    pub commit_seq: i64,
    #[serde(default)]
    pub compressed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn plain<S: Into<String>>(table: S) -> Self {
        Self {
            table: table.into(),
            alias: None,
        }
    }

    pub fn aliased<S: Into<String>, A: Into<String>>(table: S, alias: A) -> Self {
        Self {
            table: table.into(),
            alias: Some(alias.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreSnapshotRequest {
    pub table_refs: Vec<TableRef>,
    pub snapshot_name: String,
    pub snapshot: SnapshotResult,
    pub clean_partitions: bool,
    pub clean_tables: bool,
    pub atomic_restore: bool,
    pub compress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestBinlogRequest {
    pub txn_id: i64,
    pub remote_tablet_id: i64,
    pub binlog_version: i64,
    pub remote_host: String,
    pub remote_port: String,
    pub partition_id: i64,
    pub local_tablet_id: i64,
    /// Load id as (hi, lo).
    pub load_id: (i64, i64),
}

/// A storage node of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub id: i64,
    pub host: String,
    pub be_port: u16,
    pub http_port: u16,
    pub brpc_port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct BackendsResponse {
    pub status: Status,
    pub backends: Option<Vec<Backend>>,
}

#[derive(Debug, Clone, Default)]
pub struct TableMetaResponse {
    pub status: Status,
    pub db_meta: Option<DbMetaInfo>,
}

/// Catalog tree of one database as returned by the bulk metadata fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbMetaInfo {
    pub id: i64,
    pub tables: Vec<TableMetaInfo>,
    pub dropped_partitions: Vec<i64>,
    pub dropped_tables: Vec<i64>,
    pub dropped_indexes: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMetaInfo {
    pub id: i64,
    pub name: String,
    pub partitions: Vec<PartitionMetaInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionMetaInfo {
    pub id: i64,
    pub name: String,
    pub range: String,
    pub visible_version: i64,
    pub indexes: Vec<IndexMetaInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexMetaInfo {
    pub id: i64,
    pub name: String,
    pub tablets: Vec<TabletMetaInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabletMetaInfo {
    pub id: i64,
    pub replicas: Vec<ReplicaMetaInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaMetaInfo {
    pub id: i64,
    pub backend_id: i64,
    pub version: i64,
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binlog_type_wire_values_are_stable() {
        assert_eq!(BinlogType::from_wire(0), BinlogType::Upsert);
        assert_eq!(BinlogType::from_wire(10), BinlogType::Barrier);
        assert_eq!(BinlogType::from_wire(24), BinlogType::RecoverInfo);
        assert_eq!(BinlogType::from_wire(99), BinlogType::Unknown(99));
        assert_eq!(BinlogType::ReplaceTable.to_wire(), 18);
    }

    #[test]
    fn status_pattern_matching() {
        let status = Status::error(
            StatusCode::Other(7),
            "errCode = 2, detailMessage = can't find table id: 1001",
        );
        assert!(!status.is_ok());
        assert!(status.contains_any(&["table not found", "can't find table id:"]));
        assert!(!status.contains_any(&["is already aborted"]));
    }

    #[test]
    fn snapshot_result_blobs_survive_checkpointing() {
        let snapshot = SnapshotResult {
            meta: vec![0, 159, 146, 150],
            job_info: br#"{"backup_objects":{}}"#.to_vec(),
            expired_at: 1_700_000_000_000,
            commit_seq: 42,
            ..SnapshotResult::default()
        };

        let encoded = serde_json::to_string(&snapshot).unwrap();
        assert!(encoded.contains("AJ+Slg=="));
        let decoded: SnapshotResult = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, snapshot);
    }
}

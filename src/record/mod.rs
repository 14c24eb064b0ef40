//! # Changelog Payload Records
//!
//! Typed views of the JSON payloads carried by changelog entries. Each
//! record is parsed with [`parse`] and validated by its own `from_json`
//! constructor; invalid payloads are `Normal` errors.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, SyncError};

mod alter;
mod backup;
mod barrier;
mod partition;
mod table;
mod upsert;

pub use alter::{
    AlterJobV2, ColumnSchema, ColumnType, DropRollup, Index, IndexChangeJob,
    ModifyTableAddOrDropColumns, ModifyTableAddOrDropInvertedIndices, RenameRollup,
};
pub use backup::{BackupJobInfo, BackupOlapTableInfo, BackupViewInfo, NewBackupObject};
pub use barrier::BarrierLog;
pub use partition::{AddPartition, DropPartition, RenamePartition, ReplacePartition};
pub use table::{
    AlterView, CreateTable, DropTable, ModifyComment, ModifyTableProperty, RecoverInfo,
    RenameColumn, RenameTable, ReplaceTable, TruncateTable,
};
pub use upsert::{PartitionRecord, TableRecord, Upsert};

/// Kind of a catalog table as reported by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TableType {
    #[default]
    #[serde(rename = "OLAP")]
    Olap,
    #[serde(rename = "VIEW")]
    View,
    #[serde(rename = "MATERIALIZED_VIEW")]
    MaterializedView,
    #[serde(other)]
    Other,
}

pub(crate) fn parse<T: DeserializeOwned>(data: &str, what: &str) -> Result<T> {
    serde_json::from_str(data)
        .map_err(|e| SyncError::wrap(ErrorKind::Normal, format!("unmarshal {what} error"), e))
}

pub(crate) fn ensure(cond: bool, message: &str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(SyncError::normal(message))
    }
}

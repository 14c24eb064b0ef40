use serde::{Deserialize, Serialize};

use super::parse;
use crate::error::Result;

/// Ordering barrier that may wrap another changelog payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BarrierLog {
    pub db_id: i64,
    pub table_id: i64,
    /// Wire value of the wrapped changelog type.
    pub binlog_type: i64,
    pub binlog: String,
}

impl BarrierLog {
    pub fn from_json(data: &str) -> Result<Self> {
        parse(data, "barrier log")
    }
}

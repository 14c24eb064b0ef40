//! Progress entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

/// Persisted progress cursor of one job
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "progresses")]
pub struct Model {
    /// Owning job name (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_name: String,

    /// JSON-encoded progress
    #[sea_orm(column_type = "Text")]
    pub progress: String,

    /// Timestamp of the last checkpoint
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

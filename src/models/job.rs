//! Job entity model
//!
//! SeaORM entity for the `jobs` table, holding one serialized job descriptor
//! per replication job.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

/// Persisted replication job
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    /// Unique job name (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_name: String,

    /// JSON-encoded job descriptor
    #[sea_orm(column_type = "Text")]
    pub job_info: String,

    /// Syncer host that owns the job
    pub belong_to: String,

    /// Timestamp when the job was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the job descriptor was last written
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

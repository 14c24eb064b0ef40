//! Database migrations for the replication job store.
//!
//! The syncer keeps two tables: `jobs` holds the serialized job descriptor and
//! the host that owns it, `progresses` holds the serialized progress cursor.

pub use sea_orm_migration::prelude::*;

mod m2025_01_01_000001_create_jobs;
mod m2025_01_01_000002_create_progresses;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_01_01_000001_create_jobs::Migration),
            Box::new(m2025_01_01_000002_create_progresses::Migration),
        ]
    }
}

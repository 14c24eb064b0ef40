//! # Cross-Cluster Replication Syncer
//!
//! Keeps a destination database (or a single table) in step with a source
//! cluster: a snapshot bootstraps the destination, then changelog entries
//! are replayed in commit order. Progress is persisted after every step so a
//! restarted process resumes where it stopped.

pub mod cluster;
pub mod config;
pub mod error;
pub mod ingest;
pub mod job;
pub mod job_manager;
pub mod meta;
pub mod models;
pub mod progress;
pub mod record;
pub mod rpc;
pub mod storage;
pub mod telemetry;
pub use migration;

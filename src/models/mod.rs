//! # Data Models
//!
//! SeaORM entities backing the job store.

pub mod job;
pub mod progress;

pub use job::Entity as Job;
pub use progress::Entity as Progress;

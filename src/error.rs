//! # Error Handling
//!
//! Every fallible operation in the syncer returns [`SyncError`]. The error
//! carries a [`ErrorKind`] that drives recovery in the job driver and an
//! independent `panic` flag that latches a job's run loop.
//!
//! - `Meta` errors mean local metadata no longer matches the clusters; the
//!   driver answers them with a fresh full snapshot.
//! - Panic errors stop further ticks for the job until an operator acts.
//! - Everything else is logged and retried on the next tick.

use std::fmt;

use sea_orm::DbErr;
use thiserror::Error;
use tracing::error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Generic application logic failure
    Normal,
    /// Metadata drift: missing table/partition/index/tablet or mismatched shape
    Meta,
    /// Transport-level failure of a remote call
    Rpc,
    /// Frontend (coordinator) rejected or failed a request
    Fe,
    /// Backend (storage node) rejected or failed a request
    Be,
    /// Persistence store failure
    Db,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Normal => "normal",
            ErrorKind::Meta => "meta",
            ErrorKind::Rpc => "rpc",
            ErrorKind::Fe => "fe",
            ErrorKind::Be => "be",
            ErrorKind::Db => "db",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by replication code.
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct SyncError {
    kind: ErrorKind,
    message: String,
    panic: bool,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SyncError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            panic: false,
            source: None,
        }
    }

    pub fn normal<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Normal, message)
    }

    pub fn meta<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Meta, message)
    }

    pub fn rpc<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Rpc, message)
    }

    pub fn fe<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Fe, message)
    }

    pub fn be<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Be, message)
    }

    pub fn db<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Db, message)
    }

    /// Wrap an underlying error, keeping it reachable through `source()`.
    pub fn wrap<E, S>(kind: ErrorKind, message: S, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
        S: Into<String>,
    {
        Self {
            kind,
            message: message.into(),
            panic: false,
            source: Some(Box::new(source)),
        }
    }

    /// Mark the error as fatal for the job's run loop.
    pub fn into_panic(mut self) -> Self {
        self.panic = true;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_meta(&self) -> bool {
        self.kind == ErrorKind::Meta
    }

    pub fn is_panic(&self) -> bool {
        self.panic
    }

    /// Prefix the message with extra context, keeping kind and panic flag.
    pub fn context<S: AsRef<str>>(mut self, context: S) -> Self {
        self.message = format!("{}: {}", context.as_ref(), self.message);
        self
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::wrap(ErrorKind::Normal, "json codec failed", err)
    }
}

/// Helper to map database errors into the `Db` kind, logging the context.
pub fn map_db_err(context: &'static str, err: DbErr) -> SyncError {
    error!(error = ?err, context, "Database operation failed");
    SyncError::wrap(ErrorKind::Db, context, err)
}

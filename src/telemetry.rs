//! Global subscriber management and the metric names recorded by job run loops.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;
use crate::error::ErrorKind;

pub const BINLOG_HANDLED_TOTAL: &str = "ccr_binlog_handled_total";
pub const JOB_ERRORS_TOTAL: &str = "ccr_job_errors_total";
pub const JOB_COMMIT_SEQ: &str = "ccr_job_commit_seq";
pub const SYNC_TICK_DURATION_MS: &str = "ccr_sync_tick_duration_ms";
pub const INGEST_RPC_TOTAL: &str = "ccr_ingest_rpc_total";

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize global tracing/logging exactly once, wiring `log::` macros into the tracing pipeline.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    // sea-orm and sqlx log through `log::`.
    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: Failed to install log tracer bridge: {}. `log::` records will not reach the subscriber.",
                err
            );
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: Failed to set global tracing subscriber: {}. Default subscriber remains in effect.",
            err
        );
    }

    Ok(())
}

pub fn record_binlog_handled(job: &str, binlog_type: &str) {
    counter!(
        BINLOG_HANDLED_TOTAL,
        "job" => job.to_string(),
        "type" => binlog_type.to_string()
    )
    .increment(1);
}

pub fn record_job_error(job: &str, kind: ErrorKind) {
    counter!(
        JOB_ERRORS_TOTAL,
        "job" => job.to_string(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

pub fn record_commit_seq(job: &str, commit_seq: i64) {
    gauge!(JOB_COMMIT_SEQ, "job" => job.to_string()).set(commit_seq as f64);
}

pub fn record_tick_duration(job: &str, millis: f64) {
    histogram!(SYNC_TICK_DURATION_MS, "job" => job.to_string()).record(millis);
}

pub fn record_ingest_rpc(status: &'static str) {
    counter!(INGEST_RPC_TOTAL, "status" => status).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_is_idempotent() {
        let config = AppConfig {
            log_format: "pretty".to_string(),
            log_level: "debug".to_string(),
            ..AppConfig::default()
        };
        assert!(init_tracing(&config).is_ok());
        assert!(init_tracing(&config).is_ok());

        // Recording without an installed recorder is a no-op.
        record_binlog_handled("job", "upsert");
        record_job_error("job", ErrorKind::Meta);
        record_commit_seq("job", 42);
    }
}

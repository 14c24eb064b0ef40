//! Configuration loading for the replication syncer.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `CCR_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application configuration derived from `CCR_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Identity of this syncer process; persisted jobs are owned by a host.
    #[serde(default = "default_host_info")]
    pub host_info: String,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub features: FeatureFlags,
}

/// Tuning knobs for job run loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    /// Interval between two sync steps of one job (default: 3)
    ///
    /// Environment variable: `CCR_SYNC_TICK_INTERVAL_SECONDS`
    #[serde(default = "default_sync_tick_interval_seconds")]
    pub tick_interval_seconds: u64,

    /// Delay between two attempts at persisting progress (default: 3000)
    ///
    /// Environment variable: `CCR_SYNC_PERSIST_RETRY_MS`
    #[serde(default = "default_sync_persist_retry_ms")]
    pub persist_retry_ms: u64,

    /// In-flight ingest requests allowed per destination backend (default: 48)
    ///
    /// Environment variable: `CCR_SYNC_MAX_INGEST_CONCURRENCY_PER_BACKEND`
    #[serde(default = "default_sync_max_ingest_concurrency_per_backend")]
    pub max_ingest_concurrency_per_backend: usize,

    /// Attempts made to read a job's progress when recovering it (default: 3)
    ///
    /// Environment variable: `CCR_SYNC_PROGRESS_LOAD_ATTEMPTS`
    #[serde(default = "default_sync_progress_load_attempts")]
    pub progress_load_attempts: u32,
}

impl SyncConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }

    pub fn persist_retry_delay(&self) -> Duration {
        Duration::from_millis(self.persist_retry_ms)
    }

    /// Validate sync configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds == 0 {
            return Err(ConfigError::InvalidTickInterval {
                value: self.tick_interval_seconds,
            });
        }
        if self.max_ingest_concurrency_per_backend == 0 {
            return Err(ConfigError::InvalidIngestConcurrency {
                value: self.max_ingest_concurrency_per_backend,
            });
        }
        if self.progress_load_attempts == 0 {
            return Err(ConfigError::InvalidProgressLoadAttempts {
                value: self.progress_load_attempts,
            });
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_sync_tick_interval_seconds(),
            persist_retry_ms: default_sync_persist_retry_ms(),
            max_ingest_concurrency_per_backend: default_sync_max_ingest_concurrency_per_backend(),
            progress_load_attempts: default_sync_progress_load_attempts(),
        }
    }
}

/// Behaviour toggles threaded into every job at construction time.
///
/// Each flag maps to `CCR_FEATURE_<NAME>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct FeatureFlags {
    /// A finished schema change triggers a partial snapshot with replace.
    pub schema_change_partial_sync: bool,
    /// Full-sync restores clean partitions, and tables for database scope.
    pub clean_table_and_partitions: bool,
    pub atomic_restore: bool,
    /// Drop an existing view before replaying CREATE VIEW.
    pub create_view_drop_exists: bool,
    /// Restore signature mismatches are solved by alias-then-swap instead of drop.
    pub replace_not_matched_with_alias: bool,
    pub filter_shadow_indexes_upsert: bool,
    /// Resume backup/restore jobs left running by a previous process.
    pub reuse_running_backup_restore_job: bool,
    pub compressed_snapshot: bool,
    pub skip_rollup_binlogs: bool,
    /// Accept upserts carrying sub-transaction ids.
    pub txn_insert: bool,
    /// Strip `storage_medium` from replayed CREATE TABLE statements.
    pub filter_storage_medium: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            schema_change_partial_sync: true,
            clean_table_and_partitions: false,
            atomic_restore: true,
            create_view_drop_exists: true,
            replace_not_matched_with_alias: true,
            filter_shadow_indexes_upsert: true,
            reuse_running_backup_restore_job: true,
            compressed_snapshot: true,
            skip_rollup_binlogs: false,
            txn_insert: false,
            filter_storage_medium: true,
        }
    }
}

impl FeatureFlags {
    /// Applies `FEATURE_*` entries from the layered map, removing them.
    fn apply(
        &mut self,
        layered: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        let slots: [(&str, &mut bool); 11] = [
            ("SCHEMA_CHANGE_PARTIAL_SYNC", &mut self.schema_change_partial_sync),
            ("CLEAN_TABLE_AND_PARTITIONS", &mut self.clean_table_and_partitions),
            ("ATOMIC_RESTORE", &mut self.atomic_restore),
            ("CREATE_VIEW_DROP_EXISTS", &mut self.create_view_drop_exists),
            (
                "REPLACE_NOT_MATCHED_WITH_ALIAS",
                &mut self.replace_not_matched_with_alias,
            ),
            ("FILTER_SHADOW_INDEXES_UPSERT", &mut self.filter_shadow_indexes_upsert),
            (
                "REUSE_RUNNING_BACKUP_RESTORE_JOB",
                &mut self.reuse_running_backup_restore_job,
            ),
            ("COMPRESSED_SNAPSHOT", &mut self.compressed_snapshot),
            ("SKIP_ROLLUP_BINLOGS", &mut self.skip_rollup_binlogs),
            ("TXN_INSERT", &mut self.txn_insert),
            ("FILTER_STORAGE_MEDIUM", &mut self.filter_storage_medium),
        ];

        for (name, slot) in slots {
            let key = format!("FEATURE_{name}");
            if let Some(raw) = layered.remove(&key) {
                *slot = parse_bool(&key, &raw)?;
            }
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: String::new(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            host_info: default_host_info(),
            sync: SyncConfig::default(),
            features: FeatureFlags::default(),
        }
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (credentials in the database url are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        config.database_url = redact_url_credentials(&config.database_url);
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if a setting is out of bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if self.host_info.trim().is_empty() {
            return Err(ConfigError::MissingHostInfo);
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidDbMaxConnections {
                value: self.db_max_connections,
            });
        }

        self.sync.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_host_info() -> String {
    "127.0.0.1:9190".to_string()
}

fn default_sync_tick_interval_seconds() -> u64 {
    3
}

fn default_sync_persist_retry_ms() -> u64 {
    3000
}

fn default_sync_max_ingest_concurrency_per_backend() -> usize {
    48
}

fn default_sync_progress_load_attempts() -> u32 {
    3
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("host info is empty; set CCR_HOST_INFO")]
    MissingHostInfo,
    #[error("database max connections must be positive, got {value}")]
    InvalidDbMaxConnections { value: u32 },
    #[error("sync tick interval must be positive, got {value}")]
    InvalidTickInterval { value: u64 },
    #[error("ingest concurrency per backend must be positive, got {value}")]
    InvalidIngestConcurrency { value: usize },
    #[error("progress load attempts must be positive, got {value}")]
    InvalidProgressLoadAttempts { value: u32 },
    #[error("invalid boolean for CCR_{key}: '{value}'")]
    InvalidBool { key: String, value: String },
    #[error("invalid number for CCR_{key}: '{value}'")]
    InvalidNumber { key: String, value: String },
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: fn() -> T,
) -> Result<T, ConfigError> {
    match layered.remove(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber {
                key: key.to_string(),
                value: raw,
            }),
        None => Ok(default()),
    }
}

/// Replaces `user:password@` in a connection url with a marker.
fn redact_url_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}[REDACTED]{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Loads configuration using layered `.env` files and `CCR_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates the configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("CCR_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_else(default_log_format);
        let database_url = layered.remove("DATABASE_URL").unwrap_or_default();
        let db_max_connections =
            parse_number(&mut layered, "DB_MAX_CONNECTIONS", default_db_max_connections)?;
        let db_acquire_timeout_ms = parse_number(
            &mut layered,
            "DB_ACQUIRE_TIMEOUT_MS",
            default_db_acquire_timeout_ms,
        )?;
        let host_info = layered
            .remove("HOST_INFO")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_host_info);

        let sync = SyncConfig {
            tick_interval_seconds: parse_number(
                &mut layered,
                "SYNC_TICK_INTERVAL_SECONDS",
                default_sync_tick_interval_seconds,
            )?,
            persist_retry_ms: parse_number(
                &mut layered,
                "SYNC_PERSIST_RETRY_MS",
                default_sync_persist_retry_ms,
            )?,
            max_ingest_concurrency_per_backend: parse_number(
                &mut layered,
                "SYNC_MAX_INGEST_CONCURRENCY_PER_BACKEND",
                default_sync_max_ingest_concurrency_per_backend,
            )?,
            progress_load_attempts: parse_number(
                &mut layered,
                "SYNC_PROGRESS_LOAD_ATTEMPTS",
                default_sync_progress_load_attempts,
            )?,
        };

        let mut features = FeatureFlags::default();
        features.apply(&mut layered)?;

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            host_info,
            sync,
            features,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("CCR_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("CCR_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

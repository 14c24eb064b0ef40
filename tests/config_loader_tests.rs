use ccr_syncer::config::ConfigLoader;
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    unsafe {
        env::remove_var("CCR_PROFILE");
        env::remove_var("CCR_HOST_INFO");
        env::remove_var("CCR_LOG_FORMAT");
        env::remove_var("CCR_SYNC_TICK_INTERVAL_SECONDS");
        env::remove_var("CCR_SYNC_MAX_INGEST_CONCURRENCY_PER_BACKEND");
        env::remove_var("CCR_FEATURE_TXN_INSERT");
        env::remove_var("CCR_FEATURE_ATOMIC_RESTORE");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.log_format, "json");
    assert_eq!(cfg.host_info, "127.0.0.1:9190");
    assert_eq!(cfg.sync.tick_interval_seconds, 3);
    assert_eq!(cfg.sync.max_ingest_concurrency_per_backend, 48);
    assert!(cfg.features.atomic_restore);
    assert!(!cfg.features.txn_insert);
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "CCR_HOST_INFO=10.0.0.1:9190\n");
    write_env_file(&temp_dir, ".env.test", "CCR_HOST_INFO=10.0.0.2:9190\n");
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "CCR_HOST_INFO=10.0.0.3:9190\nCCR_SYNC_TICK_INTERVAL_SECONDS=5\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "CCR_PROFILE=test\nCCR_HOST_INFO=10.0.0.4:9190\nCCR_FEATURE_TXN_INSERT=true\n",
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.host_info, "10.0.0.3:9190");
    assert_eq!(cfg.sync.tick_interval_seconds, 5);
    assert!(cfg.features.txn_insert);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "CCR_HOST_INFO=10.0.0.1:9190\nCCR_FEATURE_ATOMIC_RESTORE=true\n",
    );

    unsafe {
        env::set_var("CCR_HOST_INFO", "10.9.9.9:9190");
        env::set_var("CCR_FEATURE_ATOMIC_RESTORE", "off");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.host_info, "10.9.9.9:9190");
    assert!(!cfg.features.atomic_restore);

    clear_env();
}

#[test]
fn invalid_values_return_errors() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));

    unsafe {
        env::set_var("CCR_FEATURE_TXN_INSERT", "maybe");
    }
    let err = loader.load().expect_err("invalid boolean should fail");
    assert!(format!("{}", err).contains("CCR_FEATURE_TXN_INSERT"));
    clear_env();

    unsafe {
        env::set_var("CCR_SYNC_MAX_INGEST_CONCURRENCY_PER_BACKEND", "0");
    }
    let err = loader.load().expect_err("zero concurrency should fail");
    assert!(format!("{}", err).contains("ingest concurrency per backend must be positive"));
    clear_env();

    unsafe {
        env::set_var("CCR_LOG_FORMAT", "xml");
    }
    let err = loader.load().expect_err("unknown log format should fail");
    assert!(format!("{}", err).contains("log format must be 'json' or 'pretty'"));
    clear_env();
}

use reposync::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const VARS: &[&str] = &[
    "REPOSYNC_PROFILE",
    "REPOSYNC_API_BIND_ADDR",
    "REPOSYNC_LOG_LEVEL",
    "REPOSYNC_DATABASE_URL",
    "REPOSYNC_MAX_CONCURRENT_UPDATES",
    "REPOSYNC_UPDATE_INTERVAL_RULES",
    "REPOSYNC_MAX_PRIVATE_REPOS",
    "REPOSYNC_MIN_SYNC_INTERVAL_SECONDS",
    "REPOSYNC_PROGRESS_RECORD_INTERVAL_MS",
];

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
    for var in VARS {
        unsafe {
            env::remove_var(var);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:3182");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.scheduler.max_concurrent_updates, 5);
    assert!(cfg.scheduler.update_interval_rules.is_empty());
    assert_eq!(cfg.syncer.min_sync_interval_seconds, 60);
    assert_eq!(cfg.syncer.max_private_repos, None);
    cfg.bind_addr().expect("default bind addr parses");
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "REPOSYNC_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "REPOSYNC_API_BIND_ADDR=192.168.0.10:5000\nREPOSYNC_MAX_CONCURRENT_UPDATES=12\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "REPOSYNC_API_BIND_ADDR=10.0.0.5:6000\n",
    );
    // Selects the profile before the profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "REPOSYNC_PROFILE=test\nREPOSYNC_API_BIND_ADDR=127.0.0.1:4000\n",
    );

    let cfg = loader(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.scheduler.max_concurrent_updates, 12);
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "REPOSYNC_API_BIND_ADDR=127.0.0.1:3000\nREPOSYNC_MAX_PRIVATE_REPOS=10\n",
    );
    unsafe {
        env::set_var("REPOSYNC_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("REPOSYNC_MAX_PRIVATE_REPOS", "25");
    }

    let cfg = loader(&temp_dir).load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.syncer.max_private_repos, Some(25));

    clear_env();
}

#[test]
fn interval_rules_parse_from_json() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var(
            "REPOSYNC_UPDATE_INTERVAL_RULES",
            r#"[{"pattern": "^github\\.com/acme/", "interval_minutes": 5}]"#,
        );
    }

    let cfg = loader(&temp_dir).load().expect("interval rules load");
    assert_eq!(cfg.scheduler.update_interval_rules.len(), 1);
    assert_eq!(cfg.scheduler.update_interval_rules[0].pattern, "^github\\.com/acme/");
    assert_eq!(cfg.scheduler.update_interval_rules[0].interval_minutes, 5);

    clear_env();
}

#[test]
fn malformed_interval_rules_return_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("REPOSYNC_UPDATE_INTERVAL_RULES", "not json");
    }

    let err = loader(&temp_dir).load().expect_err("bad rules should fail");
    assert!(matches!(err, ConfigError::InvalidIntervalRules { .. }));

    unsafe {
        env::set_var(
            "REPOSYNC_UPDATE_INTERVAL_RULES",
            r#"[{"pattern": "(", "interval_minutes": 5}]"#,
        );
    }
    let err = loader(&temp_dir).load().expect_err("bad pattern should fail");
    assert!(matches!(err, ConfigError::InvalidIntervalPattern { .. }));

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("REPOSYNC_API_BIND_ADDR", "not-an-addr");
    }

    let err = loader(&temp_dir)
        .load()
        .expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}

#[test]
fn zero_min_sync_interval_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "REPOSYNC_MIN_SYNC_INTERVAL_SECONDS=0\n");

    let err = loader(&temp_dir).load().expect_err("zero interval should fail");
    assert!(matches!(err, ConfigError::InvalidMinSyncInterval { value: 0 }));

    clear_env();
}

#[test]
fn oversized_intervals_are_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("REPOSYNC_MIN_SYNC_INTERVAL_SECONDS", "18446744073709551615");
    }
    let err = loader(&temp_dir).load().expect_err("huge interval should fail");
    assert!(matches!(
        err,
        ConfigError::InvalidMinSyncInterval { value: u64::MAX }
    ));

    unsafe {
        env::set_var("REPOSYNC_MIN_SYNC_INTERVAL_SECONDS", "60");
        env::set_var("REPOSYNC_PROGRESS_RECORD_INTERVAL_MS", "9223372036854775808");
    }
    let err = loader(&temp_dir).load().expect_err("huge progress interval should fail");
    assert!(matches!(err, ConfigError::InvalidProgressRecordInterval { .. }));

    clear_env();
}

#[test]
fn unparsable_numbers_return_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "REPOSYNC_MAX_CONCURRENT_UPDATES=lots\n");

    let err = loader(&temp_dir).load().expect_err("non-numeric value should fail");
    match err {
        ConfigError::InvalidValue { key, value } => {
            assert_eq!(key, "MAX_CONCURRENT_UPDATES");
            assert_eq!(value, "lots");
        }
        other => panic!("unexpected error: {other}"),
    }

    unsafe {
        env::set_var("REPOSYNC_MIN_SYNC_INTERVAL_SECONDS", "-5");
    }
    write_env_file(&temp_dir, ".env", "");
    let err = loader(&temp_dir).load().expect_err("negative interval should fail");
    assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MIN_SYNC_INTERVAL_SECONDS"));

    clear_env();
}

// Tests for environment variable handling
// Run with: cargo test --test environment_variables_test
//
// Tests share process environment, so each one holds ENV_LOCK and points
// IMAGI_CONFIG_DIR at its own temp dir.

use std::env;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use imagi::channel::ReconnectPolicy;
use imagi::{Config, SandboxConfig};
use tempfile::TempDir;

static ENV_LOCK: Mutex<()> = Mutex::new(());

const VARS: [&str; 5] = [
    "IMAGI_TIMEOUT_MS",
    "IMAGI_MEMORY_LIMIT",
    "IMAGI_OUTDOOR_MODE",
    "IMAGI_CACHE_PATH",
    "IMAGI_MIRROR_URL",
];

/// Holds the env lock and a private config dir; clears overrides on drop.
struct EnvGuard {
    _lock: MutexGuard<'static, ()>,
    dir: TempDir,
}

impl EnvGuard {
    fn new() -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for key in VARS {
            env::remove_var(key);
        }
        let dir = TempDir::new().unwrap();
        env::set_var("IMAGI_CONFIG_DIR", dir.path());
        Self { _lock: lock, dir }
    }

    fn set(&self, key: &str, value: &str) {
        env::set_var(key, value);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in VARS {
            env::remove_var(key);
        }
        env::remove_var("IMAGI_CONFIG_DIR");
    }
}

#[test]
fn test_defaults_without_env_or_file() {
    let _guard = EnvGuard::new();
    let config = Config::load().unwrap();

    assert_eq!(config.timeout(), Duration::from_secs(5));
    assert!(config.outdoor_mode);
    assert_eq!(config.device_name_prefix, "imagiCharm");
    assert!(config.mirror_url.is_none());

    let policy = ReconnectPolicy::from_config(&config);
    assert_eq!(policy.max_attempts(), 3);
    assert_eq!(policy.backoff(2), Duration::from_millis(1000));
}

#[test]
fn test_env_overrides() {
    let guard = EnvGuard::new();
    guard.set("IMAGI_TIMEOUT_MS", "750");
    guard.set("IMAGI_MEMORY_LIMIT", "1048576");
    guard.set("IMAGI_OUTDOOR_MODE", "false");
    guard.set("IMAGI_MIRROR_URL", "ws://127.0.0.1:9000/mirror");

    let config = Config::load().unwrap();
    assert_eq!(config.timeout_ms, 750);
    assert_eq!(config.memory_limit, 1_048_576);
    assert!(!config.outdoor_mode);
    assert_eq!(config.mirror_url.as_deref(), Some("ws://127.0.0.1:9000/mirror"));

    let sandbox = SandboxConfig::from(&config);
    assert_eq!(sandbox.timeout, Duration::from_millis(750));
    assert!(!sandbox.outdoor_mode);
}

#[test]
fn test_invalid_number_falls_back() {
    let guard = EnvGuard::new();
    guard.set("IMAGI_TIMEOUT_MS", "soon");

    let config = Config::load().unwrap();
    assert_eq!(config.timeout_ms, 5000);
}

#[test]
fn test_file_then_env() {
    let guard = EnvGuard::new();
    std::fs::write(
        guard.dir.path().join("config.json"),
        r#"{ "timeout_ms": 2000, "outdoor_mode": false }"#,
    )
    .unwrap();
    guard.set("IMAGI_OUTDOOR_MODE", "1");

    let config = Config::load().unwrap();
    assert_eq!(config.timeout_ms, 2000);
    assert!(config.outdoor_mode);
}

#[test]
fn test_save_round_trip() {
    let guard = EnvGuard::new();
    let mut config = Config::load().unwrap();
    config.timeout_ms = 1234;
    config.save().unwrap();

    assert!(guard.dir.path().join("config.json").exists());
    assert_eq!(Config::load().unwrap().timeout_ms, 1234);
}

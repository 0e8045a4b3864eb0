//! Configuration loading and persistence.
//!
//! Handles reading and writing the imagi configuration file, with
//! environment variable overrides applied on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants::{
    DEVICE_NAME_PREFIX, EXECUTION_TIMEOUT, MIRROR_BACKOFF_STEP, MIRROR_MAX_ATTEMPTS,
    SCRIPT_MEMORY_LIMIT,
};

/// Configuration for the imagi bridge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Wall-clock budget for one script run, in milliseconds.
    pub timeout_ms: u64,
    /// Lua heap ceiling for one script run, in bytes.
    pub memory_limit: usize,
    /// Whether renders default to the high-brightness profile.
    pub outdoor_mode: bool,
    /// Where rendered documentation snippets are cached.
    pub cache_path: PathBuf,
    /// Advertised name prefix used when discovering the accessory.
    pub device_name_prefix: String,
    /// WebSocket endpoint for live code mirroring, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_url: Option<String>,
    /// Connection attempts made by the mirror before it gives up.
    pub mirror_max_attempts: u32,
    /// Linear backoff step between mirror attempts, in milliseconds.
    pub mirror_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let cache_path = dirs::cache_dir()
            .map(|dir| dir.join("imagi"))
            .unwrap_or_else(|| PathBuf::from(".imagi"))
            .join("snippets.json");

        Self {
            timeout_ms: EXECUTION_TIMEOUT.as_millis() as u64,
            memory_limit: SCRIPT_MEMORY_LIMIT,
            outdoor_mode: true,
            cache_path,
            device_name_prefix: DEVICE_NAME_PREFIX.to_string(),
            mirror_url: None,
            mirror_max_attempts: MIRROR_MAX_ATTEMPTS,
            mirror_backoff_ms: MIRROR_BACKOFF_STEP.as_millis() as u64,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `$TMPDIR/imagi-test`
    /// 2. `IMAGI_CONFIG_DIR` env var: explicit override
    /// 3. `IMAGI_ENV=test`: `$TMPDIR/imagi-test`
    /// 4. Default: platform config dir (Linux: ~/.config/imagi)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                std::env::temp_dir().join("imagi-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("IMAGI_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else if crate::env::is_test_mode() {
                    std::env::temp_dir().join("imagi-test")
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("imagi")
                }
            }
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|e| {
            log::debug!("Using default config: {e:#}");
            Self::default()
        });
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("IMAGI_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.timeout_ms = ms;
            }
        }

        if let Ok(limit) = std::env::var("IMAGI_MEMORY_LIMIT") {
            if let Ok(bytes) = limit.parse::<usize>() {
                self.memory_limit = bytes;
            }
        }

        if let Ok(outdoor) = std::env::var("IMAGI_OUTDOOR_MODE") {
            self.outdoor_mode = matches!(outdoor.as_str(), "1" | "true" | "yes");
        }

        if let Ok(cache_path) = std::env::var("IMAGI_CACHE_PATH") {
            self.cache_path = PathBuf::from(cache_path);
        }

        if let Ok(url) = std::env::var("IMAGI_MIRROR_URL") {
            self.mirror_url = if url.is_empty() { None } else { Some(url) };
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        Ok(())
    }

    /// Script execution budget.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Mirror backoff step.
    #[must_use]
    pub fn mirror_backoff(&self) -> Duration {
        Duration::from_millis(self.mirror_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert!(config.outdoor_mode);
        assert_eq!(config.device_name_prefix, "imagiCharm");
        assert_eq!(config.mirror_max_attempts, 3);
        assert_eq!(config.mirror_backoff(), Duration::from_millis(500));
        assert!(config.cache_path.ends_with("snippets.json"));
    }

    #[test]
    fn test_config_serialization_skips_empty_mirror() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("mirror_url"));

        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = serde_json::from_str(r#"{"timeout_ms": 250}"#).unwrap();
        assert_eq!(parsed.timeout_ms, 250);
        assert_eq!(parsed.memory_limit, SCRIPT_MEMORY_LIMIT);
        assert!(parsed.outdoor_mode);
    }

    #[test]
    fn test_config_dir_is_temp_in_tests() {
        let dir = Config::config_dir().unwrap();
        assert!(dir.starts_with(std::env::temp_dir()));
    }
}

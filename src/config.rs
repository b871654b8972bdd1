//! Configuration for the progress store.
//!
//! Supports YAML file and environment variable overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::storage::memory::{DEFAULT_KV_QUOTA, DEFAULT_RECORD_QUOTA};

/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PROGRESS_STORE_CONFIG";
/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "progress-store.yaml";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PROGRESS_STORE_LOG";
/// Environment variable overriding `data_dir`.
pub const DATA_DIR_ENV_VAR: &str = "PROGRESS_STORE_DATA_DIR";
/// Environment variable overriding `min_write_interval_ms`.
pub const MIN_WRITE_INTERVAL_ENV_VAR: &str = "PROGRESS_STORE_MIN_WRITE_INTERVAL_MS";
/// Environment variable overriding `durable_timeout_ms`.
pub const DURABLE_TIMEOUT_ENV_VAR: &str = "PROGRESS_STORE_DURABLE_TIMEOUT_MS";
/// Environment variable overriding `retention_days`.
pub const RETENTION_DAYS_ENV_VAR: &str = "PROGRESS_STORE_RETENTION_DAYS";

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory for the filesystem adapters.
    pub data_dir: PathBuf,
    /// Minimum spacing between committed writes. Unforced saves arriving
    /// sooner are queued and coalesced.
    pub min_write_interval_ms: u64,
    /// Upper bound on every durable-store call.
    pub durable_timeout_ms: u64,
    /// Delay before the single retry of a transient durable failure.
    pub durable_retry_delay_ms: u64,
    /// Historical snapshots older than this are pruned.
    pub retention_days: u32,
    /// Cadence of automatic cleanup.
    pub cleanup_interval_hours: u64,
    /// Usage fraction that raises a quota warning.
    pub quota_high_water: f64,
    /// Fast-store quota for the filesystem adapter.
    pub fast_quota_bytes: u64,
    /// Durable-store quota for the filesystem adapter.
    pub durable_quota_bytes: u64,
    /// Re-reads of a head pointer that disagrees with its snapshot before
    /// treating it as corrupt.
    pub head_read_retries: usize,
    /// Buffer of the cross-tab broadcast channel.
    pub channel_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/progress"),
            min_write_interval_ms: 1000,
            durable_timeout_ms: 5000,
            durable_retry_delay_ms: 100,
            retention_days: 30,
            cleanup_interval_hours: 24,
            quota_high_water: 0.8,
            fast_quota_bytes: DEFAULT_KV_QUOTA,
            durable_quota_bytes: DEFAULT_RECORD_QUOTA,
            head_read_retries: 3,
            channel_capacity: 64,
        }
    }
}

impl StoreConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV_VAR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = env_number(MIN_WRITE_INTERVAL_ENV_VAR)? {
            self.min_write_interval_ms = ms;
        }
        if let Some(ms) = env_number(DURABLE_TIMEOUT_ENV_VAR)? {
            self.durable_timeout_ms = ms;
        }
        if let Some(days) = env_number(RETENTION_DAYS_ENV_VAR)? {
            self.retention_days = days;
        }
        Ok(())
    }

    /// Reject values the coordinator cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.quota_high_water > 0.0 && self.quota_high_water <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "quota_high_water must be in (0, 1], got {}",
                self.quota_high_water
            )));
        }
        if self.durable_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "durable_timeout_ms must be positive".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn min_write_interval(&self) -> Duration {
        Duration::from_millis(self.min_write_interval_ms)
    }

    pub fn durable_timeout(&self) -> Duration {
        Duration::from_millis(self.durable_timeout_ms)
    }

    pub fn durable_retry_delay(&self) -> Duration {
        Duration::from_millis(self.durable_retry_delay_ms)
    }

    pub fn cleanup_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cleanup_interval_hours as i64)
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{}={} is not a number", name, raw))),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.min_write_interval_ms, 1000);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.quota_high_water, 0.8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
data_dir: /tmp/progress
min_write_interval_ms: 250
durable_timeout_ms: 2000
retention_days: 7
quota_high_water: 0.9
"#;

        let config: StoreConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/progress"));
        assert_eq!(config.min_write_interval(), Duration::from_millis(250));
        assert_eq!(config.durable_timeout(), Duration::from_secs(2));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.quota_high_water, 0.9);
        // Unset fields keep defaults.
        assert_eq!(config.head_read_retries, 3);
    }

    #[test]
    fn test_invalid_high_water() {
        let config = StoreConfig {
            quota_high_water: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var(CONFIG_ENV_VAR, "/nonexistent/progress-store.yaml");
        std::env::set_var(MIN_WRITE_INTERVAL_ENV_VAR, "42");
        std::env::set_var(RETENTION_DAYS_ENV_VAR, "3");

        let config = StoreConfig::load().unwrap();
        assert_eq!(config.min_write_interval_ms, 42);
        assert_eq!(config.retention_days, 3);

        std::env::remove_var(CONFIG_ENV_VAR);
        std::env::remove_var(MIN_WRITE_INTERVAL_ENV_VAR);
        std::env::remove_var(RETENTION_DAYS_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_env_override_not_a_number() {
        std::env::set_var(CONFIG_ENV_VAR, "/nonexistent/progress-store.yaml");
        std::env::set_var(DURABLE_TIMEOUT_ENV_VAR, "soon");

        let result = StoreConfig::load();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        std::env::remove_var(CONFIG_ENV_VAR);
        std::env::remove_var(DURABLE_TIMEOUT_ENV_VAR);
    }
}

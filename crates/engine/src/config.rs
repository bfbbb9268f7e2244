//! Configuration management for the Pairlink engine.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/pairlink/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_commit_retries must be between 1 and 100, got {0}")]
    InvalidMaxCommitRetries(u32),

    #[error("worker_threads must be between 1 and 256, got {0}")]
    InvalidWorkerThreads(usize),

    #[error("orphan_message_max_age_secs must be at least 60, got {0}")]
    InvalidOrphanMaxAge(u64),

    #[error("busy_timeout_ms must be at most 60000, got {0}")]
    InvalidBusyTimeout(u64),

    #[error("database_file must be a relative file name, got {0}")]
    InvalidDatabaseFile(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Pairlink engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General engine configuration.
    pub engine: EngineConfig,

    /// Durable store configuration.
    pub store: StoreConfig,

    /// Message dispatch configuration.
    pub dispatch: DispatchConfig,
}

/// General engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the engine database.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Durable store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file name, relative to `engine.data_dir`.
    pub database_file: String,

    /// How long a connection waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
}

/// Message dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Attempts made to commit a step before giving up on a conflict.
    pub max_commit_retries: u32,

    /// Maximum number of dispatches running at the same time.
    pub worker_threads: usize,

    /// Age after which a received message with no protocol instance is
    /// discarded, in seconds.
    pub orphan_message_max_age_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_file: "engine.sqlite".to_string(),
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: 5,
            worker_threads: 4,
            orphan_message_max_age_secs: 15 * 24 * 60 * 60,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pairlink")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pairlink")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PAIRLINK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PAIRLINK_DATA_DIR: Override the data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PAIRLINK_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.engine.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("PAIRLINK_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.engine.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let retries = self.dispatch.max_commit_retries;
        if !(1..=100).contains(&retries) {
            return Err(ConfigError::InvalidMaxCommitRetries(retries));
        }

        let workers = self.dispatch.worker_threads;
        if !(1..=256).contains(&workers) {
            return Err(ConfigError::InvalidWorkerThreads(workers));
        }

        let orphan_max_age = self.dispatch.orphan_message_max_age_secs;
        if orphan_max_age < 60 {
            return Err(ConfigError::InvalidOrphanMaxAge(orphan_max_age));
        }

        if self.store.busy_timeout_ms > 60_000 {
            return Err(ConfigError::InvalidBusyTimeout(self.store.busy_timeout_ms));
        }

        let file = Path::new(&self.store.database_file);
        if self.store.database_file.is_empty()
            || file.is_absolute()
            || file.components().count() != 1
        {
            return Err(ConfigError::InvalidDatabaseFile(
                self.store.database_file.clone(),
            ));
        }

        let level = self.engine.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.engine.log_level.clone()));
        }

        Ok(())
    }

    /// Full path of the engine database.
    pub fn database_path(&self) -> PathBuf {
        self.engine.data_dir.join(&self.store.database_file)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.engine.log_level, "info");
        assert_eq!(config.store.database_file, "engine.sqlite");
        assert_eq!(config.store.busy_timeout_ms, 5_000);
        assert_eq!(config.dispatch.max_commit_retries, 5);
        assert_eq!(config.dispatch.worker_threads, 4);
        assert_eq!(config.dispatch.orphan_message_max_age_secs, 1_296_000);
        assert!(config.engine.data_dir.to_string_lossy().contains("pairlink"));
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[engine]
log_level = "debug"

[dispatch]
worker_threads = 2
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.engine.log_level, "debug");
        assert_eq!(config.dispatch.worker_threads, 2);
        assert_eq!(config.dispatch.max_commit_retries, 5);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[engine]
data_dir = "/custom/data"
log_level = "trace"

[store]
database_file = "custom.db"
busy_timeout_ms = 250

[dispatch]
max_commit_retries = 9
worker_threads = 16
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.engine.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.engine.log_level, "trace");
        assert_eq!(config.store.database_file, "custom.db");
        assert_eq!(config.store.busy_timeout_ms, 250);
        assert_eq!(config.dispatch.max_commit_retries, 9);
        assert_eq!(config.dispatch.worker_threads, 16);
        assert_eq!(config.database_path(), PathBuf::from("/custom/data/custom.db"));
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[engine
log_level = "debug"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[dispatch]
worker_threads = "many"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[engine]
log_level = "warn"
colour = "blue"

[network]
signaling_url = "wss://example.com"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.engine.log_level, "warn");
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.engine.log_level = "warn".to_string();
        original.store.busy_timeout_ms = 10;
        original.dispatch.worker_threads = 1;

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[engine]"));
        assert!(toml.contains("[store]"));
        assert!(toml.contains("[dispatch]"));
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories_and_loads_back() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("config.toml");

        let mut config = Config::default();
        config.engine.data_dir = temp_dir.path().to_path_buf();
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[store]\nbusy_timeout_ms = [").unwrap();

        let err = format!("{:#}", Config::load(&path).unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("pairlink/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("PAIRLINK_DATA_DIR");
        std::env::set_var("PAIRLINK_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.engine.log_level, "debug");

        std::env::remove_var("PAIRLINK_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_data_dir() {
        std::env::remove_var("PAIRLINK_LOG_LEVEL");
        std::env::set_var("PAIRLINK_DATA_DIR", "/tmp/pairlink-test");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.engine.data_dir, PathBuf::from("/tmp/pairlink-test"));

        std::env::remove_var("PAIRLINK_DATA_DIR");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("PAIRLINK_LOG_LEVEL", "");
        std::env::set_var("PAIRLINK_DATA_DIR", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config, Config::default());

        std::env::remove_var("PAIRLINK_LOG_LEVEL");
        std::env::remove_var("PAIRLINK_DATA_DIR");
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_commit_retries_bounds() {
        let mut config = Config::default();
        config.dispatch.max_commit_retries = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxCommitRetries(0))
        );

        config.dispatch.max_commit_retries = 100;
        assert!(config.validate().is_ok());

        config.dispatch.max_commit_retries = 101;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxCommitRetries(101))
        );
    }

    #[test]
    fn test_validate_worker_threads_bounds() {
        let mut config = Config::default();
        config.dispatch.worker_threads = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidWorkerThreads(0)));

        config.dispatch.worker_threads = 257;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidWorkerThreads(257))
        );
    }

    #[test]
    fn test_validate_orphan_max_age() {
        let mut config = Config::default();
        config.dispatch.orphan_message_max_age_secs = 59;
        assert_eq!(config.validate(), Err(ConfigError::InvalidOrphanMaxAge(59)));

        config.dispatch.orphan_message_max_age_secs = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_busy_timeout() {
        let mut config = Config::default();
        config.store.busy_timeout_ms = 60_001;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBusyTimeout(60_001))
        );
    }

    #[test]
    fn test_validate_database_file() {
        let mut config = Config::default();
        for bad in ["", "/abs/engine.sqlite", "nested/engine.sqlite"] {
            config.store.database_file = bad.to_string();
            assert_eq!(
                config.validate(),
                Err(ConfigError::InvalidDatabaseFile(bad.to_string()))
            );
        }
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.engine.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.engine.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}

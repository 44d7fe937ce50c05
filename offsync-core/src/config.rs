//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/offsync/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/offsync/` (~/.config/offsync/)
//! - Data: `$XDG_DATA_HOME/offsync/` (~/.local/share/offsync/)
//! - State/Logs: `$XDG_STATE_HOME/offsync/` (~/.local/state/offsync/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Ingest server used when neither the runtime override nor the config
/// file names one. Set `OFFSYNC_SERVER_URL` at build time to bake in a
/// different endpoint.
pub const DEFAULT_SERVER_URL: &str = match option_env!("OFFSYNC_SERVER_URL") {
    Some(url) => url,
    None => "http://localhost:3000",
};

/// Shortest cadence the periodic sync may run at (15 minutes).
pub const MIN_PERIODIC_INTERVAL_SECS: u64 = 15 * 60;

/// Longest retention window accepted from config (100 years).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Upload settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Retention settings
    #[serde(default)]
    pub retention: RetentionConfig,

    /// At-rest storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Batch uploader and scheduler configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Ingest server base URL. The runtime override in prefs wins over this.
    pub server_url: Option<String>,

    /// Samples per upload attempt
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Seconds between periodic sync attempts
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval_secs: u64,

    /// Also send the raw device token in `x-device-token`
    #[serde(default)]
    pub send_token_header: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout(),
            periodic_interval_secs: default_periodic_interval(),
            send_token_header: false,
        }
    }
}

impl SyncConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > 500 {
            return Err(Error::Config(
                "sync.batch_size must be between 1 and 500".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "sync.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.periodic_interval_secs < MIN_PERIODIC_INTERVAL_SECS {
            return Err(Error::Config(format!(
                "sync.periodic_interval_secs must be at least {}",
                MIN_PERIODIC_INTERVAL_SECS
            )));
        }
        if let Some(url) = &self.server_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "sync.server_url must be an http(s) URL, got {:?}",
                    url
                )));
            }
        }
        Ok(())
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_timeout() -> u64 {
    10
}

fn default_periodic_interval() -> u64 {
    MIN_PERIODIC_INTERVAL_SECS
}

/// Which rows the retention pruner may delete
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Delete every expired row, including ones never delivered
    #[default]
    All,
    /// Only delete expired rows the server has acknowledged
    DeliveredOnly,
}

/// Retention configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    /// Samples older than this many days are pruned
    #[serde(default = "default_retention_days")]
    pub days: u32,

    /// Whether pending samples are pruned too
    #[serde(default)]
    pub policy: RetentionPolicy,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
            policy: RetentionPolicy::default(),
        }
    }
}

impl RetentionConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.days > MAX_RETENTION_DAYS {
            return Err(Error::Config(format!(
                "retention.days must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }
        Ok(())
    }
}

fn default_retention_days() -> u32 {
    90
}

/// At-rest storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Encrypt sample payloads with the installation secret
    #[serde(default = "default_encrypt")]
    pub encrypt: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            encrypt: default_encrypt(),
        }
    }
}

fn default_encrypt() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also log to stderr (the CLI turns this on for `offsync run`)
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stderr: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.sync.validate()?;
        config.retention.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/offsync/config.toml` (~/.config/offsync/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("offsync").join("config.toml")
    }

    /// Returns the data directory path (database, prefs, secret)
    ///
    /// `$XDG_DATA_HOME/offsync/` (~/.local/share/offsync/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("offsync")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/offsync/` (~/.local/state/offsync/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("offsync")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/offsync/samples.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("samples.db")
    }

    /// Returns the directory holding the key-value namespaces
    ///
    /// `$XDG_DATA_HOME/offsync/prefs/`
    pub fn prefs_dir() -> PathBuf {
        Self::data_dir().join("prefs")
    }

    /// Returns the file holding the at-rest encryption secret
    ///
    /// `$XDG_DATA_HOME/offsync/secret.key`
    pub fn secret_path() -> PathBuf {
        Self::data_dir().join("secret.key")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/offsync/offsync.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("offsync.log")
    }

    /// Set the XDG variables to their defaults when unset, so every path
    /// helper and child process agrees on the same locations.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

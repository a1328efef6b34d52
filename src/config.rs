//! Engine configuration: JSON file with env overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// SQLite file for the message cache. `None` keeps the cache in memory.
    pub db_path: Option<PathBuf>,
    pub page_size: u32,
    pub fetch_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Bound for read-position commits.
    pub write_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            db_path: None,
            page_size: DEFAULT_PAGE_SIZE,
            fetch_timeout_ms: 10_000,
            send_timeout_ms: 15_000,
            write_timeout_ms: 5_000,
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ROOMSYNC_*` environment overrides on top of `self`.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(path) = lookup("ROOMSYNC_DB_PATH") {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(v) = lookup("ROOMSYNC_PAGE_SIZE") {
            self.page_size = parse_env("ROOMSYNC_PAGE_SIZE", v)?;
        }
        if let Some(v) = lookup("ROOMSYNC_FETCH_TIMEOUT_MS") {
            self.fetch_timeout_ms = parse_env("ROOMSYNC_FETCH_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("ROOMSYNC_SEND_TIMEOUT_MS") {
            self.send_timeout_ms = parse_env("ROOMSYNC_SEND_TIMEOUT_MS", v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be at least 1".into()));
        }
        if self.fetch_timeout_ms == 0 || self.send_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

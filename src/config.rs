//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::index::IndexConfig;
use crate::query::{QueryConfig, ScanPreference};
use crate::storage::{CompressionType, StorageConfig as EngineStorageConfig, StoreConfig, WalSyncMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub index: IndexSettings,

    #[serde(default)]
    pub query: QuerySettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Point store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Capacity limit; unbounded when absent
    #[serde(default)]
    pub max_points: Option<usize>,

    #[serde(default)]
    pub wal_sync: WalSyncMode,

    #[serde(default)]
    pub compression: CompressionType,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("tsagg").to_string_lossy().to_string())
        .unwrap_or_else(|| "./tsagg_data".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_points: None,
            wal_sync: WalSyncMode::default(),
            compression: CompressionType::default(),
        }
    }
}

/// Tag/time index configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexSettings {
    /// Tag keys that get posting lists; every key when absent
    #[serde(default)]
    pub indexed_tags: Option<Vec<String>>,
}

/// Planner and executor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QuerySettings {
    #[serde(default = "default_selectivity_threshold")]
    pub selectivity_threshold: f64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_slow_query_ms")]
    pub slow_query_threshold_ms: u64,

    #[serde(default)]
    pub scan: ScanPreference,
}

fn default_selectivity_threshold() -> f64 {
    0.3
}

fn default_batch_size() -> usize {
    1024
}

fn default_slow_query_ms() -> u64 {
    100
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            selectivity_threshold: default_selectivity_threshold(),
            batch_size: default_batch_size(),
            slow_query_threshold_ms: default_slow_query_ms(),
            scan: ScanPreference::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tsagg").join("config.toml")),
            Some(PathBuf::from("/etc/tsagg/config.toml")),
            Some(PathBuf::from("./tsagg.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply `TSAGG_*` overrides from `lookup`; unparsable values are ignored
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(data_dir) = lookup("TSAGG_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }
        if let Some(max_points) = lookup("TSAGG_MAX_POINTS") {
            match max_points.parse() {
                Ok(n) => self.storage.max_points = Some(n),
                Err(_) => tracing::warn!("Ignoring TSAGG_MAX_POINTS={:?}", max_points),
            }
        }

        if let Some(threshold) = lookup("TSAGG_SELECTIVITY_THRESHOLD") {
            match threshold.parse() {
                Ok(t) => self.query.selectivity_threshold = t,
                Err(_) => tracing::warn!("Ignoring TSAGG_SELECTIVITY_THRESHOLD={:?}", threshold),
            }
        }

        if let Some(level) = lookup("TSAGG_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("TSAGG_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.data_dir.is_empty() {
            return Err(ConfigError::Invalid("storage.data_dir is empty".into()));
        }
        if self.storage.max_points == Some(0) {
            return Err(ConfigError::Invalid("storage.max_points must be at least 1".into()));
        }
        let threshold = self.query.selectivity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "query.selectivity_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.query.batch_size == 0 {
            return Err(ConfigError::Invalid("query.batch_size must be at least 1".into()));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be \"pretty\" or \"json\", got {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Data directory with a leading `~` expanded
    pub fn data_dir(&self) -> PathBuf {
        let raw = &self.storage.data_dir;
        match (raw.strip_prefix("~/"), dirs::home_dir()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(raw),
        }
    }

    pub fn storage_config(&self) -> EngineStorageConfig {
        let index = match &self.index.indexed_tags {
            Some(tags) => IndexConfig::only(tags.iter().cloned()),
            None => IndexConfig::default(),
        };
        EngineStorageConfig {
            store: StoreConfig {
                data_dir: Some(self.data_dir()),
                max_points: self.storage.max_points,
                wal_sync: self.storage.wal_sync,
                compression: self.storage.compression,
            },
            index,
        }
    }

    pub fn query_config(&self) -> QueryConfig {
        QueryConfig {
            selectivity_threshold: self.query.selectivity_threshold,
            batch_size: self.query.batch_size,
            slow_query_threshold: Duration::from_millis(self.query.slow_query_threshold_ms),
            scan_preference: self.query.scan,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# tsagg Configuration
#
# Environment variables override these settings:
# - TSAGG_DATA_DIR
# - TSAGG_MAX_POINTS
# - TSAGG_SELECTIVITY_THRESHOLD
# - TSAGG_LOG_LEVEL
# - TSAGG_LOG_FORMAT

[storage]
# Directory for the write-ahead log and sealed segments
data_dir = "~/.local/share/tsagg"

# Maximum number of stored points (omit for unbounded)
# max_points = 10000000

# WAL sync strategy: every_write, batched, none
wal_sync = "batched"

# Segment block compression: lz4, none
compression = "lz4"

[index]
# Tag keys to index (omit to index every tag key)
# indexed_tags = ["hostname", "region"]

[query]
# Use the index when the estimated fraction of points touched is below this
selectivity_threshold = 0.3

# Candidates processed between cancellation checks
batch_size = 1024

# Queries at or above this duration are logged as slow (ms)
slow_query_threshold_ms = 100

# Scan strategy: auto, index, full
scan = "auto"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

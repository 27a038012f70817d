//! Configuration file parser for ~/.config/feedwatch/config.toml.
//!
//! The config file is optional — a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde, though we log a warning when the file
//! contains potential typos. Values are checked by [`Config::validate`].
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::feed::{FeedActivityPattern, ItemHasher, RawIdItemHasher, Sha256ItemHasher};
use crate::reader::{
    FixedIntervalStrategy, HttpError, MonitoringSettings, MovingAverageStrategy,
    ReqwestHttpClient, SchedulerSettings, StoreItemsAction, TaskContext, UpdateStrategy,
    MAX_RESPONSE_BYTES,
};
use crate::storage::FeedStore;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file. Defaults to `feeds.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,

    /// Maximum number of feed tasks running at once.
    pub thread_count: usize,

    pub wake_up_interval_secs: u64,

    /// How often the reader re-reads the store. 0 = never.
    pub store_sync_interval_secs: u64,

    pub http_timeout_secs: u64,
    pub max_response_bytes: usize,
    pub user_agent: String,

    /// Cycles slower than this are reported as EXECUTION_TIME_WARNING.
    pub execution_warn_secs: u64,

    pub max_immediate_retries: u32,
    pub max_average_processing_secs: u64,
    pub checks_to_unreachable_ratio: u32,
    pub checks_to_unparsable_ratio: u32,

    /// `moving_average` or `fixed`.
    pub update_strategy: String,
    pub fixed_interval_minutes: u32,
    pub min_interval_minutes: u32,
    pub max_interval_minutes: u32,

    /// Only feeds with these patterns are scheduled. Empty = all feeds.
    pub activity_patterns: Vec<FeedActivityPattern>,

    /// Write new items to the item archive after each modified poll.
    pub archive_items: bool,

    /// Item fingerprint: `sha256` (title, link and id) or `raw_id`.
    pub item_hash: String,

    pub monitoring: MonitoringConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".to_string(),
            thread_count: 200,
            wake_up_interval_secs: 60,
            store_sync_interval_secs: 600,
            http_timeout_secs: 30,
            max_response_bytes: MAX_RESPONSE_BYTES,
            user_agent: concat!("feedwatch/", env!("CARGO_PKG_VERSION")).to_string(),
            execution_warn_secs: 180,
            max_immediate_retries: 3,
            max_average_processing_secs: 600,
            checks_to_unreachable_ratio: 10,
            checks_to_unparsable_ratio: 10,
            update_strategy: "moving_average".to_string(),
            fixed_interval_minutes: 60,
            min_interval_minutes: 1,
            max_interval_minutes: 24 * 60,
            activity_patterns: Vec::new(),
            archive_items: false,
            item_hash: "sha256".to_string(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// `[monitoring]` table: thresholds for the per-pass health report.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub max_slow_percentage: u32,
    pub max_unreachable_percentage: u32,
    pub max_unparsable_percentage: u32,
    pub wake_up_warning_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_slow_percentage: 10,
            max_unreachable_percentage: 2,
            max_unparsable_percentage: 2,
            wake_up_warning_secs: 120,
        }
    }
}

const KNOWN_KEYS: [&str; 21] = [
    "database_path",
    "log_level",
    "thread_count",
    "wake_up_interval_secs",
    "store_sync_interval_secs",
    "http_timeout_secs",
    "max_response_bytes",
    "user_agent",
    "execution_warn_secs",
    "max_immediate_retries",
    "max_average_processing_secs",
    "checks_to_unreachable_ratio",
    "checks_to_unparsable_ratio",
    "update_strategy",
    "fixed_interval_minutes",
    "min_interval_minutes",
    "max_interval_minutes",
    "activity_patterns",
    "archive_items",
    "item_hash",
    "monitoring",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate TOML content.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == 0 {
            return Err(invalid("thread_count", "must be at least 1"));
        }
        if self.wake_up_interval_secs == 0 {
            return Err(invalid("wake_up_interval_secs", "must be at least 1"));
        }
        if self.http_timeout_secs == 0 {
            return Err(invalid("http_timeout_secs", "must be at least 1"));
        }
        if self.max_response_bytes == 0 {
            return Err(invalid("max_response_bytes", "must be at least 1"));
        }
        if self.checks_to_unreachable_ratio == 0 {
            return Err(invalid("checks_to_unreachable_ratio", "must be at least 1"));
        }
        if self.checks_to_unparsable_ratio == 0 {
            return Err(invalid("checks_to_unparsable_ratio", "must be at least 1"));
        }
        if !matches!(self.item_hash.as_str(), "sha256" | "raw_id") {
            return Err(invalid(
                "item_hash",
                format!("unknown hash '{}', expected 'sha256' or 'raw_id'", self.item_hash),
            ));
        }
        match self.update_strategy.as_str() {
            "moving_average" => {
                if self.min_interval_minutes == 0 {
                    return Err(invalid("min_interval_minutes", "must be at least 1"));
                }
                if self.min_interval_minutes > self.max_interval_minutes {
                    return Err(invalid(
                        "max_interval_minutes",
                        format!("must not be below min_interval_minutes ({})", self.min_interval_minutes),
                    ));
                }
            }
            "fixed" => {
                if self.fixed_interval_minutes == 0 {
                    return Err(invalid("fixed_interval_minutes", "must be at least 1"));
                }
            }
            other => {
                return Err(invalid(
                    "update_strategy",
                    format!("unknown strategy '{other}', expected 'moving_average' or 'fixed'"),
                ));
            }
        }
        Ok(())
    }

    /// Configured database path, or `feeds.db` in `config_dir`.
    pub fn database_path(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("feeds.db"))
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            thread_count: self.thread_count,
            wake_up_interval: Duration::from_secs(self.wake_up_interval_secs),
            max_immediate_retries: self.max_immediate_retries,
            max_average_processing_time: Duration::from_secs(self.max_average_processing_secs),
            checks_to_unreachable_ratio: self.checks_to_unreachable_ratio,
            checks_to_unparsable_ratio: self.checks_to_unparsable_ratio,
            activity_patterns: self.activity_patterns.clone(),
            monitoring: MonitoringSettings {
                max_slow_percentage: self.monitoring.max_slow_percentage,
                max_unreachable_percentage: self.monitoring.max_unreachable_percentage,
                max_unparsable_percentage: self.monitoring.max_unparsable_percentage,
                wake_up_warning: Duration::from_secs(self.monitoring.wake_up_warning_secs),
            },
        }
    }

    pub fn store_sync_interval(&self) -> Duration {
        Duration::from_secs(self.store_sync_interval_secs)
    }

    pub fn update_strategy(&self) -> Arc<dyn UpdateStrategy> {
        match self.update_strategy.as_str() {
            "fixed" => Arc::new(FixedIntervalStrategy {
                minutes: self.fixed_interval_minutes,
            }),
            _ => Arc::new(MovingAverageStrategy {
                min_minutes: self.min_interval_minutes,
                max_minutes: self.max_interval_minutes,
            }),
        }
    }

    pub fn item_hasher(&self) -> Arc<dyn ItemHasher> {
        match self.item_hash.as_str() {
            "raw_id" => Arc::new(RawIdItemHasher),
            _ => Arc::new(Sha256ItemHasher),
        }
    }

    pub fn http_client(&self) -> Result<ReqwestHttpClient, HttpError> {
        ReqwestHttpClient::new(
            Duration::from_secs(self.http_timeout_secs),
            self.max_response_bytes,
            &self.user_agent,
        )
    }

    /// Task context with the configured HTTP client, strategy, hasher and thresholds.
    ///
    /// With `archive_items` the processing hook stores new items; otherwise it only logs.
    pub fn task_context(&self, store: Arc<dyn FeedStore>) -> Result<TaskContext, HttpError> {
        let mut ctx = TaskContext::new(Arc::new(self.http_client()?), Arc::clone(&store))
            .with_strategy(self.update_strategy())
            .with_hasher(self.item_hasher())
            .with_execution_warn(Duration::from_secs(self.execution_warn_secs));
        if self.archive_items {
            ctx = ctx.with_action(Arc::new(StoreItemsAction::new(store)));
        }
        Ok(ctx)
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Configuration management for the telemetry relay.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Default ingestion endpoint (can be overridden at compile time via TELEMETRY_DEFAULT_ENDPOINT).
pub const DEFAULT_ENDPOINT_ADDRESS: &str = match option_env!("TELEMETRY_DEFAULT_ENDPOINT") {
    Some(url) => url,
    None => "https://dc.services.visualstudio.com/v2/track",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Items known to be quarantined on disk before new failed batches are dropped.
pub const DEFAULT_MAX_BACKLOG_ITEMS: usize = 10_000;

/// Items buffered in memory before a batch is cut.
pub const DEFAULT_BUFFER_CAPACITY: usize = 500;

/// Bounded wait for the transmission permit.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 1_000;

/// HTTP request timeout for a single delivery attempt.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Telemetry channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Absolute URI batches are POSTed to.
    pub endpoint_address: String,
    /// Admission-control cap on the quarantined item counter.
    pub max_backlog_items: usize,
    /// Buffer capacity that triggers a flush.
    pub buffer_capacity: usize,
    /// Base directory for local persistence. `analytics/` is created below it.
    /// Falls back to the relay base directory when unset.
    pub storage_base_path: Option<PathBuf>,
    /// Developer mode: every item is flushed immediately.
    pub developer_mode: bool,
    /// Bounded wait for the transmission permit, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Per-request HTTP timeout, in seconds.
    pub request_timeout_secs: u64,
    /// Quarantined files older than this are evicted by the sweeper.
    /// Disabled when unset.
    pub max_quarantine_age_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            endpoint_address: DEFAULT_ENDPOINT_ADDRESS.to_string(),
            max_backlog_items: DEFAULT_MAX_BACKLOG_ITEMS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            storage_base_path: None,
            developer_mode: false,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_quarantine_age_secs: None,
        }
    }
}

impl Config {
    /// Load configuration from the config file under `paths`, falling back to
    /// defaults, then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    fn load_from_env(&mut self) {
        self.apply_env_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `TELEMETRY_*` overrides read through `lookup`.
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).and_then(non_empty);

        if let Some(level) = lookup("TELEMETRY_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(endpoint) = lookup("TELEMETRY_ENDPOINT") {
            self.endpoint_address = endpoint;
        }
        if let Some(max) = lookup("TELEMETRY_MAX_BACKLOG_ITEMS").and_then(|v| v.parse().ok()) {
            self.max_backlog_items = max;
        }
        if let Some(capacity) = lookup("TELEMETRY_BUFFER_CAPACITY").and_then(|v| v.parse().ok()) {
            self.buffer_capacity = capacity;
        }
        if let Some(path) = lookup("TELEMETRY_STORAGE_PATH") {
            self.storage_base_path = Some(PathBuf::from(path));
        }
        if let Some(flag) = lookup("TELEMETRY_DEVELOPER_MODE").and_then(|v| parse_flag(&v)) {
            self.developer_mode = flag;
        }
    }

    /// Parse the endpoint address as an absolute URI.
    pub fn endpoint_url(&self) -> CoreResult<Url> {
        Url::parse(self.endpoint_address.trim()).map_err(CoreError::from)
    }

    /// Check the values the channel cannot run without.
    pub fn validate(&self) -> CoreResult<()> {
        self.endpoint_url()?;
        if self.buffer_capacity == 0 {
            return Err(CoreError::Config(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(CoreError::Config(
                "lock_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Base directory the `analytics/` working directory lives under.
    pub fn storage_base(&self, paths: &Paths) -> PathBuf {
        self.storage_base_path
            .clone()
            .unwrap_or_else(|| paths.base_dir().clone())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_quarantine_age(&self) -> Option<Duration> {
        self.max_quarantine_age_secs.map(Duration::from_secs)
    }
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

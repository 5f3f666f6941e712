//! File system paths for the telemetry relay.

use crate::{CoreError, CoreResult};
use std::path::{Path, PathBuf};

/// Directory name of the batch working directory under a storage base.
const ANALYTICS_DIR_NAME: &str = "analytics";

/// Manages file system paths for the relay.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for relay files (~/.telemetry-relay)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.telemetry-relay`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(".telemetry-relay"),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.telemetry-relay).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.telemetry-relay/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the logs directory (~/.telemetry-relay/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Get the JSONL log file path (~/.telemetry-relay/logs/relay.jsonl).
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("relay.jsonl")
    }

    /// Batch working directory below an arbitrary storage base.
    pub fn analytics_dir_under(storage_base: &Path) -> PathBuf {
        storage_base.join(ANALYTICS_DIR_NAME)
    }

    /// Ensure the base and logs directories exist.
    /// The analytics directory is created lazily by the channel itself.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

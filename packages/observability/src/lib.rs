//! # Observability
//!
//! Centralized tracing setup for the telemetry relay workspace.
//!
//! Crates in the workspace only emit `tracing` events; the binary calls
//! `observability::init_with_config` once at startup and decides
//! where those events end up:
//!
//! - compact human-readable lines on stderr
//! - optionally, structured JSONL appended to a log file
//!
//! `RUST_LOG` always wins over the configured default level.
//!
//! ## Usage
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "telemetry-relay".into(),
//!         default_level: "debug".into(),
//!         log_path: Some("/tmp/relay.jsonl".into()),
//!         ..Default::default()
//!     });
//!
//!     tracing::info!("relay started");
//! }
//! ```

mod file_sink;
mod json_layer;

use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use file_sink::CentralLogWriter;
pub use json_layer::{JsonLayer, LogEntry};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included in every JSONL line.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Optional JSONL log file. No file output when `None`.
    pub log_path: Option<PathBuf>,

    /// Emit compact logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: true,
        }
    }
}

/// Initialize the observability layer with custom configuration.
///
/// Installing a second global subscriber is a no-op, so tests and embedding
/// hosts may call this more than once. A log file that cannot be opened is
/// reported on stderr and file output is skipped.
pub fn init_with_config(config: LogConfig) {
    let json_layer = config.log_path.as_ref().and_then(|path| {
        match CentralLogWriter::new(path) {
            Ok(writer) => Some(
                JsonLayer::new(config.service_name.clone(), writer)
                    .with_filter(env_filter(&config.default_level)),
            ),
            Err(err) => {
                eprintln!("failed to open log file {}: {}", path.display(), err);
                None
            }
        }
    });

    let stderr_layer = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(env_filter(&config.default_level))
    });

    let installed = tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(
            service = %config.service_name,
            log_path = ?config.log_path,
            "observability initialized"
        );
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

/// Re-export Level for advanced filtering.
pub use tracing::Level;

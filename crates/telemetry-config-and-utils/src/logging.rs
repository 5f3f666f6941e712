//! Logging initialization for the relay.
//!
//! Thin wrapper over the observability crate so binaries configure logging
//! from the same `Config` and `Paths` they load everything else from.

use std::path::PathBuf;

/// Initialize the logging system.
///
/// - compact output on stderr
/// - structured JSONL to `log_file` when given
/// - `RUST_LOG` overrides `level`
///
/// ```ignore
/// init_logging("info", Some(paths.log_file()));
/// tracing::info!("relay started");
/// ```
pub fn init_logging(level: &str, log_file: Option<PathBuf>) {
    observability::init_with_config(observability::LogConfig {
        service_name: "telemetry-relay".into(),
        default_level: normalize_level(level).into(),
        log_path: log_file,
        also_stderr: true,
    });
}

fn normalize_level(level: &str) -> &'static str {
    match parse_level(level) {
        tracing::Level::TRACE => "trace",
        tracing::Level::DEBUG => "debug",
        tracing::Level::INFO => "info",
        tracing::Level::WARN => "warn",
        tracing::Level::ERROR => "error",
    }
}

/// Parse a log level string into a tracing Level. Unknown values map to INFO.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.trim().to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

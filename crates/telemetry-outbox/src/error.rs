//! Outbox error types.

use batch_file_store::BatchFileError;
use telemetry_config_and_utils::CoreError;
use thiserror::Error;

/// Outbox error type.
///
/// Only construction errors reach callers of the channel; everything raised on
/// the transmission and sweep paths is logged and absorbed there.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Invalid channel configuration (e.g. endpoint is not an absolute URI)
    #[error("Invalid configuration: {0}")]
    Config(#[from] CoreError),

    /// Channel constructed outside a Tokio runtime
    #[error("Telemetry channel requires a Tokio runtime")]
    NoRuntime,

    /// Batch file error
    #[error("Batch file error: {0}")]
    BatchFile(#[from] BatchFileError),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with a non-success status
    #[error("Delivery rejected: HTTP {status}: {body}")]
    Delivery { status: u16, body: String },

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Blocking file task failed to complete
    #[error("Background task failed: {0}")]
    Task(String),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;

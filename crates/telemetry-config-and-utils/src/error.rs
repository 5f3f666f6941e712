//! Core error types for configuration loading.

use thiserror::Error;

/// Error type for configuration and path resolution.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Path error (e.g., home directory not found)
    #[error("Path error: {0}")]
    Path(String),
}

/// Result type alias using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_url_converts_from_parse_error() {
        let err: CoreError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, CoreError::InvalidUrl(_)));
        assert!(err.to_string().starts_with("Invalid URL"));
    }

    #[test]
    fn config_error_display() {
        let err = CoreError::Config("buffer_capacity must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: buffer_capacity must be positive"
        );
    }
}

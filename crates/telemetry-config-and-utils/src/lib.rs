//! Configuration, file system paths and logging setup for the telemetry relay.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, DEFAULT_BUFFER_CAPACITY, DEFAULT_ENDPOINT_ADDRESS, DEFAULT_LOCK_TIMEOUT_MS,
    DEFAULT_LOG_LEVEL, DEFAULT_MAX_BACKLOG_ITEMS, DEFAULT_REQUEST_TIMEOUT_SECS,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;

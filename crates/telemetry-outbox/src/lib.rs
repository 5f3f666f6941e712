//! Durable delivery channel for telemetry.
//!
//! This crate provides:
//! - TelemetryChannel: public `send` / `flush` / `dispose` surface
//! - Transmitter: write-ahead persistence, one delivery attempt, then commit or quarantine
//! - BacklogSweeper: single-flight, cancellable retry of quarantined batches
//! - WorkingDirectory: lazy directory setup and crash recovery
//! - HttpBatchSender: HTTP POST delivery

mod backlog;
mod buffer;
mod channel;
mod error;
mod item;
mod sender;
mod serializer;
mod sweeper;
mod transmitter;
mod working_dir;

#[cfg(test)]
mod tests;

pub use backlog::BacklogCounter;
pub use buffer::{FullCallback, InMemoryBuffer, TelemetryBuffer};
pub use channel::{ChannelSettings, ChannelStats, TelemetryChannel};
pub use error::{OutboxError, OutboxResult};
pub use item::{Batch, TelemetryItem};
pub use sender::{BatchSender, HttpBatchSender, SenderConfig};
pub use serializer::{BatchSerializer, JsonStreamSerializer, JSON_STREAM_CONTENT_TYPE};
pub use sweeper::{BacklogSweeper, SweepGuard, SweepReport};
pub use transmitter::{TransmitOutcome, Transmitter};
pub use working_dir::WorkingDirectory;

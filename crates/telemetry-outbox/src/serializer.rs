//! Batch serialization.

use crate::{Batch, OutboxResult};

/// Media type of newline-delimited JSON batches.
pub const JSON_STREAM_CONTENT_TYPE: &str = "application/x-json-stream";

/// Turns a batch into the bytes that are persisted and POSTed.
pub trait BatchSerializer: Send + Sync {
    /// Value sent as the `Content-Type` header.
    fn content_type(&self) -> &str;

    fn serialize(&self, batch: &Batch) -> OutboxResult<Vec<u8>>;
}

/// One JSON document per line, in batch order.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStreamSerializer;

impl BatchSerializer for JsonStreamSerializer {
    fn content_type(&self) -> &str {
        JSON_STREAM_CONTENT_TYPE
    }

    fn serialize(&self, batch: &Batch) -> OutboxResult<Vec<u8>> {
        let mut payload = Vec::new();
        for item in batch.items() {
            serde_json::to_writer(&mut payload, item)?;
            payload.push(b'\n');
        }
        Ok(payload)
    }
}

//! The batch buffer contract the channel depends on, plus a minimal
//! in-memory implementation.
//!
//! The channel registers a full-callback with [`TelemetryBuffer::set_on_full`]
//! and drains the buffer with [`TelemetryBuffer::dequeue`] when it fires.

use crate::{Batch, TelemetryItem};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Callback invoked when the buffer is full or explicitly flushed.
pub type FullCallback = Arc<dyn Fn() + Send + Sync>;

/// Buffer collaborator: enqueue, drain-all dequeue, capacity, full-event.
///
/// Implementations must invoke the full-callback without holding any lock
/// that [`dequeue`](TelemetryBuffer::dequeue) needs.
pub trait TelemetryBuffer: Send + Sync {
    /// Add an item; fires the full-callback once capacity is reached.
    fn enqueue(&self, item: TelemetryItem);

    /// Remove and return everything buffered, in enqueue order.
    fn dequeue(&self) -> Batch;

    /// Number of items that triggers the full-callback.
    fn capacity(&self) -> usize;

    /// Number of items currently buffered.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register the full-callback, replacing any previous one.
    fn set_on_full(&self, callback: FullCallback);

    /// Fire the full-callback regardless of how many items are buffered.
    fn flush(&self);
}

/// Vec-backed buffer with a fixed capacity.
pub struct InMemoryBuffer {
    capacity: usize,
    items: Mutex<Vec<TelemetryItem>>,
    on_full: RwLock<Option<FullCallback>>,
}

impl InMemoryBuffer {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(Vec::with_capacity(capacity)),
            on_full: RwLock::new(None),
        }
    }

    fn fire(&self) {
        let callback = self.on_full.read().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl TelemetryBuffer for InMemoryBuffer {
    fn enqueue(&self, item: TelemetryItem) {
        let full = {
            let mut items = self.items.lock();
            items.push(item);
            items.len() >= self.capacity
        };
        if full {
            self.fire();
        }
    }

    fn dequeue(&self) -> Batch {
        let mut items = self.items.lock();
        Batch::new(std::mem::replace(
            &mut *items,
            Vec::with_capacity(self.capacity),
        ))
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn set_on_full(&self, callback: FullCallback) {
        *self.on_full.write() = Some(callback);
    }

    fn flush(&self) {
        self.fire();
    }
}

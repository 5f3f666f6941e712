//! Approximate count of quarantined items, used for admission control.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Running total of items the channel has quarantined during its lifetime.
///
/// Never reconciled against the directory and never decremented: successful
/// retries do not free capacity. The capacity check and the add both happen
/// while the transmission permit is held, so the cap is overshot by at most
/// the one batch admitted while the counter was still below it.
#[derive(Debug)]
pub struct BacklogCounter {
    items: AtomicUsize,
    max_items: usize,
}

impl BacklogCounter {
    pub fn new(max_items: usize) -> Self {
        Self {
            items: AtomicUsize::new(0),
            max_items,
        }
    }

    pub fn items(&self) -> usize {
        self.items.load(Ordering::Acquire)
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// True once the counter has reached the cap.
    pub fn is_full(&self) -> bool {
        self.items() >= self.max_items
    }

    pub fn add(&self, items: usize) {
        self.items.fetch_add(items, Ordering::AcqRel);
    }
}

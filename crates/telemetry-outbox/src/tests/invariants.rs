//! Invariants that hold across many flushes.

use super::harness::{
    item, leftover_quarantined, settings, store_under, FailingSender, GatedSender,
    RecordingSender,
};
use crate::{BatchSender, OutboxError, OutboxResult, TelemetryChannel};
use async_trait::async_trait;
use batch_file_store::{BatchFileState, StoreCounts};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Tracks how many sends overlap.
#[derive(Default)]
struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
    sends: AtomicUsize,
}

#[async_trait]
impl BatchSender for ConcurrencyProbe {
    async fn send(&self, _payload: &[u8], _content_type: &str) -> OutboxResult<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails while `failing` is set.
#[derive(Default)]
struct SwitchableSender {
    failing: AtomicBool,
}

#[async_trait]
impl BatchSender for SwitchableSender {
    async fn send(&self, _payload: &[u8], _content_type: &str) -> OutboxResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OutboxError::Delivery {
                status: 500,
                body: String::new(),
            });
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_transmission_in_flight() {
    let dir = tempdir().unwrap();
    let mut settings = settings(dir.path(), 1);
    settings.lock_timeout = Duration::from_secs(10);
    let probe = Arc::new(ConcurrencyProbe::default());
    let channel = TelemetryChannel::new(settings, probe.clone()).unwrap();

    for n in 0..10 {
        channel.send(item(n));
    }
    channel.wait_for_background_tasks().await;

    assert_eq!(probe.sends.load(Ordering::SeqCst), 10);
    assert_eq!(probe.max.load(Ordering::SeqCst), 1);
    assert_eq!(channel.stats().batches_delivered, 10);
}

#[tokio::test]
async fn at_most_one_sweep_in_flight() {
    let dir = tempdir().unwrap();
    let store = store_under(dir.path());
    leftover_quarantined(&store, "backlog\n");
    let sender = GatedSender::holding("backlog");
    let channel = TelemetryChannel::new(settings(dir.path(), 1), sender.clone()).unwrap();

    channel.send(item(0));
    sender.wait_entered(1).await;
    for n in 1..5 {
        channel.send(item(n));
    }
    // Let the transmissions of the extra flushes finish.
    channel.flush();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(channel.stats().sweeping);
    assert_eq!(sender.entered(), 1);

    sender.release(1);
    channel.wait_for_background_tasks().await;

    let stats = channel.stats();
    assert_eq!(stats.sweeps, 1);
    assert!(!stats.sweeping);
    assert_eq!(stats.batches_delivered, 5);
    assert_eq!(store.counts().unwrap(), StoreCounts::default());
}

/// The cap is checked before adding, so it is overshot by at most one batch.
#[tokio::test]
async fn backlog_is_bounded() {
    let dir = tempdir().unwrap();
    let mut settings = settings(dir.path(), 10);
    settings.max_backlog_items = 25;
    let channel = TelemetryChannel::new(settings, FailingSender::new()).unwrap();

    for batch in 0..6 {
        for n in 0..10 {
            channel.send(item(batch * 10 + n));
        }
        channel.wait_for_background_tasks().await;
    }

    let stats = channel.stats();
    assert_eq!(stats.backlog_items, 30);
    assert_eq!(stats.batches_quarantined, 3);
    assert_eq!(stats.batches_dropped, 3);
    assert_eq!(store_under(dir.path()).counts().unwrap().quarantined, 3);
}

/// Redelivered backlog does not give capacity back.
#[tokio::test]
async fn successful_retries_do_not_free_backlog_capacity() {
    let dir = tempdir().unwrap();
    let mut settings = settings(dir.path(), 5);
    settings.max_backlog_items = 5;
    let sender = Arc::new(SwitchableSender::default());
    sender.failing.store(true, Ordering::SeqCst);
    let channel = TelemetryChannel::new(settings, sender.clone()).unwrap();
    let store = store_under(dir.path());

    for n in 0..5 {
        channel.send(item(n));
    }
    channel.wait_for_background_tasks().await;
    assert_eq!(store.counts().unwrap().quarantined, 1);

    sender.failing.store(false, Ordering::SeqCst);
    channel.flush();
    channel.wait_for_background_tasks().await;
    assert_eq!(store.counts().unwrap(), StoreCounts::default());
    assert_eq!(channel.backlog_items(), 5);

    sender.failing.store(true, Ordering::SeqCst);
    for n in 5..10 {
        channel.send(item(n));
    }
    channel.wait_for_background_tasks().await;
    assert_eq!(channel.stats().batches_dropped, 1);
    assert_eq!(store.counts().unwrap(), StoreCounts::default());
}

/// A file the endpoint always rejects stays put and does not stop the rest.
#[tokio::test]
async fn poison_batch_is_isolated() {
    let dir = tempdir().unwrap();
    let store = store_under(dir.path());
    let poison = leftover_quarantined(&store, "poison\n");
    leftover_quarantined(&store, "good one\n");
    leftover_quarantined(&store, "good two\n");
    let sender = RecordingSender::rejecting("poison");
    let channel = TelemetryChannel::new(settings(dir.path(), 10), sender.clone()).unwrap();

    channel.flush();
    channel.wait_for_background_tasks().await;

    assert_eq!(sender.delivered_count(), 2);
    assert_eq!(store.list(BatchFileState::Quarantined).unwrap(), vec![poison.clone()]);

    channel.flush();
    channel.wait_for_background_tasks().await;

    assert_eq!(sender.attempts(), 4);
    assert_eq!(store.list(BatchFileState::Quarantined).unwrap(), vec![poison]);
}

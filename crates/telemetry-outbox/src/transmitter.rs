//! Primary delivery path: write-ahead, send, then commit or quarantine.

use crate::working_dir::run_blocking;
use crate::{BacklogCounter, Batch, BatchSender, BatchSerializer, OutboxError, WorkingDirectory};
use batch_file_store::{BatchFile, BatchFileStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// What happened to one batch handed to [`Transmitter::transmit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitOutcome {
    /// Nothing to send.
    Empty,
    /// Another transmission held the permit past the lock timeout, or the
    /// channel was disposed. The batch is lost.
    Abandoned,
    /// Delivered and its file deleted.
    Delivered,
    /// Delivery failed; the file was kept for the backlog sweeper.
    Quarantined,
    /// Delivery failed with the backlog already at its cap; the file was deleted.
    Dropped,
    /// The batch could not be serialized or written. Nothing is on disk.
    Failed,
}

/// Sends one batch at a time.
///
/// A single-permit semaphore serializes attempts. Waiting for it is bounded
/// by `lock_timeout`, past which the new batch is abandoned rather than
/// queued behind a slow network call.
pub struct Transmitter {
    permit: Semaphore,
    lock_timeout: Duration,
    working_dir: Arc<WorkingDirectory>,
    sender: Arc<dyn BatchSender>,
    serializer: Arc<dyn BatchSerializer>,
    backlog: Arc<BacklogCounter>,
}

impl Transmitter {
    pub fn new(
        working_dir: Arc<WorkingDirectory>,
        sender: Arc<dyn BatchSender>,
        serializer: Arc<dyn BatchSerializer>,
        backlog: Arc<BacklogCounter>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            permit: Semaphore::new(1),
            lock_timeout,
            working_dir,
            sender,
            serializer,
            backlog,
        }
    }

    /// Close the permit. Waiting and later transmissions are abandoned;
    /// an attempt already holding the permit runs to completion.
    pub fn close(&self) {
        self.permit.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permit.is_closed()
    }

    /// Transmit one batch. Never fails: every problem is logged and folded
    /// into the returned outcome.
    pub async fn transmit(&self, batch: Batch) -> TransmitOutcome {
        if batch.is_empty() {
            return TransmitOutcome::Empty;
        }
        let items = batch.len();

        let _permit = match timeout(self.lock_timeout, self.permit.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                debug!(items, "Channel disposed, abandoning batch");
                return TransmitOutcome::Abandoned;
            }
            Err(_) => {
                debug!(
                    items,
                    lock_timeout_ms = self.lock_timeout.as_millis() as u64,
                    "Transmission in progress, abandoning batch"
                );
                return TransmitOutcome::Abandoned;
            }
        };

        let payload = match self.serializer.serialize(&batch) {
            Ok(payload) => payload,
            Err(err) => {
                error!(items, error = %err, "Failed to serialize batch");
                return TransmitOutcome::Failed;
            }
        };

        let store = match self.working_dir.ensure_ready().await {
            Ok(store) => store,
            Err(err) => {
                warn!(
                    items,
                    dir = %self.working_dir.path().display(),
                    error = %err,
                    "Working directory unavailable, dropping batch"
                );
                return TransmitOutcome::Failed;
            }
        };

        let written = run_blocking(store, move |store| {
            store.write_fresh(&payload).map(|file| (file, payload))
        })
        .await;
        let (file, payload) = match written {
            Ok(written) => written,
            Err(err) => {
                warn!(items, error = %err, "Failed to persist batch, dropping it");
                return TransmitOutcome::Failed;
            }
        };

        match self
            .sender
            .send(&payload, self.serializer.content_type())
            .await
        {
            Ok(()) => {
                remove_file(store, &file).await;
                debug!(batch_file = %file.file_name(), items, "Batch delivered");
                TransmitOutcome::Delivered
            }
            Err(err) => self.finalize_failure(store, file, items, err).await,
        }
    }

    async fn finalize_failure(
        &self,
        store: &BatchFileStore,
        file: BatchFile,
        items: usize,
        err: OutboxError,
    ) -> TransmitOutcome {
        if self.backlog.is_full() {
            warn!(
                batch_file = %file.file_name(),
                items,
                backlog_items = self.backlog.items(),
                max_backlog_items = self.backlog.max_items(),
                error = %err,
                "Delivery failed and backlog is full, dropping batch"
            );
            remove_file(store, &file).await;
            return TransmitOutcome::Dropped;
        }

        self.backlog.add(items);
        let target = file.clone();
        match run_blocking(store, move |store| store.quarantine(&target)).await {
            Ok(quarantined) => {
                info!(
                    batch_file = %quarantined.file_name(),
                    items,
                    backlog_items = self.backlog.items(),
                    error = %err,
                    "Delivery failed, batch quarantined"
                );
            }
            Err(rename_err) => {
                // Left fresh, the next process start quarantines it.
                warn!(
                    batch_file = %file.file_name(),
                    items,
                    error = %rename_err,
                    "Failed to quarantine batch file"
                );
            }
        }
        TransmitOutcome::Quarantined
    }
}

async fn remove_file(store: &BatchFileStore, file: &BatchFile) {
    let target = file.clone();
    if let Err(err) = run_blocking(store, move |store| store.remove(&target)).await {
        warn!(batch_file = %file.file_name(), error = %err, "Failed to delete batch file");
    }
}

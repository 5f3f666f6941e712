//! Retry path for quarantined batches.

use crate::working_dir::run_blocking;
use crate::{BatchSender, OutboxResult, WorkingDirectory};
use batch_file_store::{BatchFile, BatchFileState, BatchFileStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tally of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Files a delivery was attempted for.
    pub attempted: usize,
    /// Files delivered and deleted.
    pub delivered: usize,
    /// Files left in place after a failed attempt.
    pub failed: usize,
    /// Files deleted for exceeding the quarantine age limit.
    pub evicted: usize,
    /// Whether the pass stopped early on cancellation.
    pub cancelled: bool,
}

/// Marks a sweep as running. Dropping it marks the sweeper idle again.
#[derive(Debug)]
pub struct SweepGuard {
    running: Arc<AtomicBool>,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Retries quarantined batch files one at a time, with at most one pass
/// running per channel.
pub struct BacklogSweeper {
    running: Arc<AtomicBool>,
    working_dir: Arc<WorkingDirectory>,
    sender: Arc<dyn BatchSender>,
    content_type: String,
    max_age: Option<Duration>,
}

impl BacklogSweeper {
    pub fn new(
        working_dir: Arc<WorkingDirectory>,
        sender: Arc<dyn BatchSender>,
        content_type: impl Into<String>,
        max_age: Option<Duration>,
    ) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            working_dir,
            sender,
            content_type: content_type.into(),
            max_age,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the single sweep slot. `None` when a pass is already running.
    pub fn try_begin(&self) -> Option<SweepGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard {
                running: self.running.clone(),
            })
    }

    /// Run one pass unless another is running.
    pub async fn sweep_backlog(&self, cancel: &CancellationToken) -> Option<SweepReport> {
        let guard = self.try_begin()?;
        Some(self.sweep(guard, cancel).await)
    }

    /// Run one pass holding `guard`, checking `cancel` before each file.
    pub async fn sweep(&self, guard: SweepGuard, cancel: &CancellationToken) -> SweepReport {
        let mut report = SweepReport::default();

        let store = match self.working_dir.ensure_ready().await {
            Ok(store) => store,
            Err(err) => {
                warn!(error = %err, "Working directory unavailable, skipping sweep");
                drop(guard);
                return report;
            }
        };

        let files = match run_blocking(store, |store| store.list(BatchFileState::Quarantined)).await
        {
            Ok(files) => files,
            Err(err) => {
                warn!(
                    dir = %store.dir().display(),
                    error = %err,
                    "Failed to enumerate quarantined batches"
                );
                drop(guard);
                return report;
            }
        };

        for file in files {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            if self.evict_if_expired(store, &file).await {
                report.evicted += 1;
                continue;
            }

            report.attempted += 1;
            match self.retry(store, &file).await {
                Ok(()) => {
                    report.delivered += 1;
                    debug!(batch_file = %file.file_name(), "Quarantined batch delivered");
                }
                Err(err) => {
                    report.failed += 1;
                    debug!(
                        batch_file = %file.file_name(),
                        error = %err,
                        "Quarantined batch retry failed"
                    );
                }
            }
        }

        drop(guard);

        if report.delivered > 0 || report.evicted > 0 || report.cancelled {
            info!(
                attempted = report.attempted,
                delivered = report.delivered,
                failed = report.failed,
                evicted = report.evicted,
                cancelled = report.cancelled,
                "Backlog sweep finished"
            );
        } else {
            debug!(
                attempted = report.attempted,
                failed = report.failed,
                "Backlog sweep finished"
            );
        }
        report
    }

    /// Claim, read, send and delete one file. The claim is held until the
    /// file is gone, so a second sweeper on the same directory skips it.
    async fn retry(&self, store: &BatchFileStore, file: &BatchFile) -> OutboxResult<()> {
        let target = file.clone();
        let mut lockable = run_blocking(store, move |store| store.open(&target)).await?;
        let mut claim = lockable.try_claim()?;
        let payload = claim.read_payload()?;
        self.sender.send(&payload, &self.content_type).await?;

        let target = file.clone();
        if let Err(err) = run_blocking(store, move |store| store.remove(&target)).await {
            // Delivered anyway; a leftover file is only retried again.
            warn!(batch_file = %file.file_name(), error = %err, "Failed to delete delivered batch");
        }
        drop(claim);
        Ok(())
    }

    async fn evict_if_expired(&self, store: &BatchFileStore, file: &BatchFile) -> bool {
        let Some(max_age) = self.max_age else {
            return false;
        };

        let target = file.clone();
        let age = match run_blocking(store, move |store| store.age(&target)).await {
            Ok(age) => age,
            Err(err) => {
                debug!(batch_file = %file.file_name(), error = %err, "Could not read batch age");
                return false;
            }
        };
        if age <= max_age {
            return false;
        }

        let target = file.clone();
        match run_blocking(store, move |store| store.remove(&target)).await {
            Ok(()) => {
                info!(
                    batch_file = %file.file_name(),
                    age_secs = age.as_secs(),
                    "Evicted expired quarantined batch"
                );
                true
            }
            Err(err) => {
                warn!(batch_file = %file.file_name(), error = %err, "Failed to evict batch");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::harness::{FailingSender, GatedSender, RecordingSender};
    use batch_file_store::StoreCounts;
    use std::path::Path;
    use tempfile::tempdir;

    async fn setup(
        path: &Path,
        sender: Arc<dyn BatchSender>,
        max_age: Option<Duration>,
    ) -> (Arc<BacklogSweeper>, BatchFileStore) {
        let store = BatchFileStore::new(path.join("analytics"));
        let working_dir = Arc::new(WorkingDirectory::new(
            store.clone(),
            CancellationToken::new(),
            false,
        ));
        working_dir.ensure_ready().await.unwrap();
        let sweeper = Arc::new(BacklogSweeper::new(
            working_dir,
            sender,
            "application/x-json-stream",
            max_age,
        ));
        (sweeper, store)
    }

    fn quarantine(store: &BatchFileStore, payload: &str) -> BatchFile {
        let fresh = store.write_fresh(payload.as_bytes()).unwrap();
        store.quarantine(&fresh).unwrap()
    }

    #[tokio::test]
    async fn delivers_and_deletes_quarantined_files() {
        let dir = tempdir().unwrap();
        let sender = RecordingSender::new();
        let (sweeper, store) = setup(dir.path(), sender.clone(), None).await;
        for i in 0..3 {
            quarantine(&store, &format!("{{\"n\":{i}}}\n"));
        }

        let report = sweeper
            .sweep_backlog(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 3);
        assert_eq!(store.counts().unwrap(), StoreCounts::default());
        assert!(!sweeper.is_running());
    }

    #[tokio::test]
    async fn fresh_files_are_not_swept() {
        let dir = tempdir().unwrap();
        let sender = RecordingSender::new();
        let (sweeper, store) = setup(dir.path(), sender.clone(), None).await;
        store.write_fresh(b"in flight\n").unwrap();

        let report = sweeper
            .sweep_backlog(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.attempted, 0);
        assert_eq!(sender.attempts(), 0);
        assert_eq!(store.counts().unwrap().fresh, 1);
    }

    #[tokio::test]
    async fn poison_file_does_not_block_others() {
        let dir = tempdir().unwrap();
        let sender = RecordingSender::rejecting("poison");
        let (sweeper, store) = setup(dir.path(), sender.clone(), None).await;
        let poison = quarantine(&store, "poison\n");
        quarantine(&store, "good one\n");
        quarantine(&store, "good two\n");

        let report = sweeper
            .sweep_backlog(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        let left = store.list(BatchFileState::Quarantined).unwrap();
        assert_eq!(left, vec![poison]);
    }

    #[tokio::test]
    async fn failed_retries_keep_files() {
        let dir = tempdir().unwrap();
        let sender = FailingSender::new();
        let (sweeper, store) = setup(dir.path(), sender.clone(), None).await;
        quarantine(&store, "a\n");
        quarantine(&store, "b\n");

        let report = sweeper
            .sweep_backlog(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(sender.attempts(), 2);
        assert_eq!(store.counts().unwrap().quarantined, 2);
    }

    #[tokio::test]
    async fn cancelled_sweep_stops_before_next_file() {
        let dir = tempdir().unwrap();
        let sender = RecordingSender::new();
        let (sweeper, store) = setup(dir.path(), sender.clone(), None).await;
        quarantine(&store, "a\n");
        quarantine(&store, "b\n");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = sweeper.sweep_backlog(&cancel).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.attempted, 0);
        assert_eq!(store.counts().unwrap().quarantined, 2);
        assert!(!sweeper.is_running());
    }

    #[tokio::test]
    async fn only_one_sweep_at_a_time() {
        let dir = tempdir().unwrap();
        let sender = GatedSender::new();
        let (sweeper, store) = setup(dir.path(), sender.clone(), None).await;
        quarantine(&store, "a\n");

        let running = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.sweep_backlog(&CancellationToken::new()).await })
        };
        while sender.entered() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(sweeper.is_running());
        assert!(sweeper.try_begin().is_none());
        assert!(sweeper
            .sweep_backlog(&CancellationToken::new())
            .await
            .is_none());

        sender.release(1);
        let report = running.await.unwrap().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(sender.entered(), 1);
        assert!(sweeper.try_begin().is_some());
    }

    #[tokio::test]
    async fn sweepers_sharing_a_directory_deliver_each_file_once() {
        let dir = tempdir().unwrap();
        let sender = GatedSender::new();
        let (first, store) = setup(dir.path(), sender.clone(), None).await;
        let (second, _) = setup(dir.path(), sender.clone(), None).await;
        quarantine(&store, "shared\n");

        let running = {
            let first = first.clone();
            tokio::spawn(async move { first.sweep_backlog(&CancellationToken::new()).await })
        };
        sender.wait_entered(1).await;

        let skipped = second
            .sweep_backlog(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(skipped.attempted, 1);
        assert_eq!(skipped.delivered, 0);
        assert_eq!(skipped.failed, 1);
        assert_eq!(sender.entered(), 1);

        sender.release(1);
        let report = running.await.unwrap().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(sender.completed(), 1);
        assert_eq!(store.counts().unwrap(), StoreCounts::default());
    }

    #[tokio::test]
    async fn guard_resets_flag_on_drop() {
        let dir = tempdir().unwrap();
        let (sweeper, _) = setup(dir.path(), RecordingSender::new(), None).await;

        let guard = sweeper.try_begin().unwrap();
        assert!(sweeper.is_running());
        drop(guard);
        assert!(!sweeper.is_running());
    }

    #[tokio::test]
    async fn expired_files_are_evicted_when_enabled() {
        let dir = tempdir().unwrap();
        let sender = RecordingSender::new();
        let (sweeper, store) = setup(dir.path(), sender.clone(), Some(Duration::ZERO)).await;
        quarantine(&store, "old\n");
        std::thread::sleep(Duration::from_millis(20));

        let report = sweeper
            .sweep_backlog(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.evicted, 1);
        assert_eq!(report.attempted, 0);
        assert_eq!(sender.attempts(), 0);
        assert_eq!(store.counts().unwrap(), StoreCounts::default());
    }
}

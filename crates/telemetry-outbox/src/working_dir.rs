//! Lazily initialized batch working directory.

use crate::{OutboxError, OutboxResult};
use batch_file_store::{BatchFileResult, BatchFileStore};
use channel_lifecycle::install_shutdown_hook;
use std::path::Path;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The channel's `analytics/` directory.
///
/// The first [`ensure_ready`](Self::ensure_ready) creates the directory, or,
/// when it already exists, quarantines fresh files an earlier process left
/// behind. Concurrent first callers wait for that single initialization.
pub struct WorkingDirectory {
    store: BatchFileStore,
    ready: OnceCell<()>,
    shutdown: CancellationToken,
    install_shutdown_hook: bool,
}

impl WorkingDirectory {
    pub fn new(store: BatchFileStore, shutdown: CancellationToken, install_shutdown_hook: bool) -> Self {
        Self {
            store,
            ready: OnceCell::new(),
            shutdown,
            install_shutdown_hook,
        }
    }

    pub fn path(&self) -> &Path {
        self.store.dir()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    /// Token cancelled when the host process shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Initialize on first use and return the store.
    ///
    /// Only a failure to create the directory is an error; it leaves the
    /// directory uninitialized so the next caller tries again.
    pub async fn ensure_ready(&self) -> OutboxResult<&BatchFileStore> {
        self.ready.get_or_try_init(|| self.initialize()).await?;
        Ok(&self.store)
    }

    async fn initialize(&self) -> OutboxResult<()> {
        let existed = run_blocking(&self.store, |store| store.ensure_dir()).await?;

        if existed {
            let report =
                run_blocking(&self.store, |store| Ok(store.recover_interrupted())).await?;
            if report.quarantined > 0 || report.temp_removed > 0 || report.failures > 0 {
                info!(
                    dir = %self.store.dir().display(),
                    quarantined = report.quarantined,
                    temp_removed = report.temp_removed,
                    failures = report.failures,
                    "Recovered batch files from previous run"
                );
            }
        } else {
            debug!(dir = %self.store.dir().display(), "Created working directory");
        }

        if self.install_shutdown_hook {
            if let Err(err) = install_shutdown_hook(self.shutdown.clone()) {
                warn!(error = %err, "Could not install shutdown hook");
            }
        }

        Ok(())
    }
}

/// Run a batch file operation on the blocking pool.
pub(crate) async fn run_blocking<T, F>(store: &BatchFileStore, op: F) -> OutboxResult<T>
where
    F: FnOnce(&BatchFileStore) -> BatchFileResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|err| OutboxError::Task(err.to_string()))?
        .map_err(OutboxError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_file_store::{BatchFileState, StoreCounts};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn working_dir(path: &Path) -> WorkingDirectory {
        WorkingDirectory::new(
            BatchFileStore::new(path.join("analytics")),
            CancellationToken::new(),
            false,
        )
    }

    #[tokio::test]
    async fn creates_missing_directory() {
        let dir = tempdir().unwrap();
        let wd = working_dir(dir.path());
        assert!(!wd.is_ready());

        let store = wd.ensure_ready().await.unwrap();
        assert!(store.dir().is_dir());
        assert!(wd.is_ready());
    }

    #[tokio::test]
    async fn quarantines_leftovers_of_previous_run() {
        let dir = tempdir().unwrap();
        let previous = BatchFileStore::new(dir.path().join("analytics"));
        previous.ensure_dir().unwrap();
        let leftover = previous.write_fresh(b"{}\n").unwrap();

        let wd = working_dir(dir.path());
        let store = wd.ensure_ready().await.unwrap();

        let quarantined = store.list(BatchFileState::Quarantined).unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].id(), leftover.id());
    }

    #[tokio::test]
    async fn initializes_only_once() {
        let dir = tempdir().unwrap();
        let wd = working_dir(dir.path());
        let store = wd.ensure_ready().await.unwrap().clone();

        // A fresh file written after initialization belongs to this run.
        let fresh = store.write_fresh(b"{}\n").unwrap();
        wd.ensure_ready().await.unwrap();

        assert!(fresh.path().exists());
        assert_eq!(
            store.counts().unwrap(),
            StoreCounts {
                fresh: 1,
                quarantined: 0
            }
        );
    }

    #[tokio::test]
    async fn concurrent_first_use_is_serialized() {
        let dir = tempdir().unwrap();
        let previous = BatchFileStore::new(dir.path().join("analytics"));
        previous.ensure_dir().unwrap();
        for _ in 0..5 {
            previous.write_fresh(b"{}\n").unwrap();
        }

        let wd = Arc::new(working_dir(dir.path()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let wd = wd.clone();
            handles.push(tokio::spawn(async move {
                wd.ensure_ready().await.map(|_| ()).is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(previous.counts().unwrap().quarantined, 5);
    }

    #[tokio::test]
    async fn creation_failure_is_retried_later() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("analytics");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let wd = working_dir(dir.path());
        assert!(wd.ensure_ready().await.is_err());
        assert!(!wd.is_ready());

        std::fs::remove_file(&blocker).unwrap();
        assert!(wd.ensure_ready().await.is_ok());
    }
}

//! The public channel: `send`, `flush`, `dispose`.

use crate::{
    BacklogCounter, BacklogSweeper, BatchSender, BatchSerializer, HttpBatchSender, InMemoryBuffer,
    JsonStreamSerializer, OutboxError, OutboxResult, SenderConfig, TelemetryBuffer,
    TelemetryItem, TransmitOutcome, Transmitter, WorkingDirectory,
};
use batch_file_store::BatchFileStore;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use telemetry_config_and_utils::{
    Config, Paths, DEFAULT_BUFFER_CAPACITY, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_MAX_BACKLOG_ITEMS,
    DEFAULT_REQUEST_TIMEOUT_SECS,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};
use url::Url;

/// Resolved channel settings.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Absolute URI batches are POSTed to.
    pub endpoint: Url,
    /// Quarantined item count past which new failed batches are dropped.
    pub max_backlog_items: usize,
    /// Items buffered before a batch is cut.
    pub buffer_capacity: usize,
    /// The `analytics/` working directory.
    pub storage_dir: PathBuf,
    /// Flush on every item.
    pub developer_mode: bool,
    /// Bounded wait for the transmission permit.
    pub lock_timeout: Duration,
    /// HTTP request timeout of the bundled sender.
    pub request_timeout: Duration,
    /// Quarantined files older than this are deleted by the sweeper.
    pub max_quarantine_age: Option<Duration>,
    /// Cancel backlog retries on Ctrl-C / SIGTERM.
    pub install_shutdown_hook: bool,
}

impl ChannelSettings {
    /// Defaults for everything except the endpoint and the storage base.
    pub fn new(endpoint: Url, storage_base: impl AsRef<Path>) -> Self {
        Self {
            endpoint,
            max_backlog_items: DEFAULT_MAX_BACKLOG_ITEMS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            storage_dir: Paths::analytics_dir_under(storage_base.as_ref()),
            developer_mode: false,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_quarantine_age: None,
            install_shutdown_hook: false,
        }
    }

    /// Validate `config` and resolve it against `paths`.
    pub fn from_config(config: &Config, paths: &Paths) -> OutboxResult<Self> {
        config.validate()?;
        Ok(Self {
            endpoint: config.endpoint_url()?,
            max_backlog_items: config.max_backlog_items,
            buffer_capacity: config.buffer_capacity,
            storage_dir: Paths::analytics_dir_under(&config.storage_base(paths)),
            developer_mode: config.developer_mode,
            lock_timeout: config.lock_timeout(),
            request_timeout: config.request_timeout(),
            max_quarantine_age: config.max_quarantine_age(),
            install_shutdown_hook: false,
        })
    }

    /// Capacity the bundled buffer flushes at.
    pub fn effective_buffer_capacity(&self) -> usize {
        if self.developer_mode {
            1
        } else {
            self.buffer_capacity.max(1)
        }
    }
}

/// Point-in-time view of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub buffered: usize,
    pub backlog_items: usize,
    pub max_backlog_items: usize,
    pub batches_delivered: usize,
    pub batches_quarantined: usize,
    pub batches_dropped: usize,
    pub batches_abandoned: usize,
    pub batches_failed: usize,
    pub sweeps: usize,
    pub sweeping: bool,
    pub disposed: bool,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicUsize,
    quarantined: AtomicUsize,
    dropped: AtomicUsize,
    abandoned: AtomicUsize,
    failed: AtomicUsize,
    sweeps: AtomicUsize,
}

impl Counters {
    fn record(&self, outcome: TransmitOutcome) {
        let counter = match outcome {
            TransmitOutcome::Empty => return,
            TransmitOutcome::Abandoned => &self.abandoned,
            TransmitOutcome::Delivered => &self.delivered,
            TransmitOutcome::Quarantined => &self.quarantined,
            TransmitOutcome::Dropped => &self.dropped,
            TransmitOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Durable telemetry delivery channel.
///
/// Items are buffered in memory. Each time the buffer fills (or
/// [`flush`](Self::flush) is called) the captured batch is written to disk,
/// sent, and deleted on success or quarantined for the backlog sweeper on
/// failure. Transmission and sweeping run as background tasks; producers
/// never wait on the network.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct TelemetryChannel {
    core: Arc<ChannelCore>,
}

struct ChannelCore {
    buffer: Arc<dyn TelemetryBuffer>,
    transmitter: Transmitter,
    sweeper: BacklogSweeper,
    working_dir: Arc<WorkingDirectory>,
    backlog: Arc<BacklogCounter>,
    tasks: TaskTracker,
    runtime: Handle,
    disposed: AtomicBool,
    counters: Counters,
}

impl TelemetryChannel {
    /// Channel with the bundled in-memory buffer and JSON stream serializer.
    pub fn new(settings: ChannelSettings, sender: Arc<dyn BatchSender>) -> OutboxResult<Self> {
        let buffer = Arc::new(InMemoryBuffer::new(settings.effective_buffer_capacity()));
        Self::with_parts(settings, buffer, sender, Arc::new(JsonStreamSerializer))
    }

    /// Channel delivering over HTTP to `settings.endpoint`.
    pub fn with_http(settings: ChannelSettings) -> OutboxResult<Self> {
        let sender = HttpBatchSender::new(SenderConfig {
            endpoint: settings.endpoint.clone(),
            timeout: settings.request_timeout,
        })?;
        Self::new(settings, Arc::new(sender))
    }

    /// HTTP channel built from configuration.
    pub fn from_config(config: &Config, paths: &Paths) -> OutboxResult<Self> {
        Self::with_http(ChannelSettings::from_config(config, paths)?)
    }

    /// Channel with caller-supplied collaborators.
    ///
    /// Must be called inside a Tokio runtime; background tasks are spawned
    /// onto it.
    pub fn with_parts(
        settings: ChannelSettings,
        buffer: Arc<dyn TelemetryBuffer>,
        sender: Arc<dyn BatchSender>,
        serializer: Arc<dyn BatchSerializer>,
    ) -> OutboxResult<Self> {
        let runtime = Handle::try_current().map_err(|_| OutboxError::NoRuntime)?;

        let working_dir = Arc::new(WorkingDirectory::new(
            BatchFileStore::new(settings.storage_dir.clone()),
            CancellationToken::new(),
            settings.install_shutdown_hook,
        ));
        let backlog = Arc::new(BacklogCounter::new(settings.max_backlog_items));
        let sweeper = BacklogSweeper::new(
            working_dir.clone(),
            sender.clone(),
            serializer.content_type(),
            settings.max_quarantine_age,
        );
        let transmitter = Transmitter::new(
            working_dir.clone(),
            sender,
            serializer,
            backlog.clone(),
            settings.lock_timeout,
        );

        let core = Arc::new(ChannelCore {
            buffer,
            transmitter,
            sweeper,
            working_dir,
            backlog,
            tasks: TaskTracker::new(),
            runtime,
            disposed: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let weak: Weak<ChannelCore> = Arc::downgrade(&core);
        core.buffer.set_on_full(Arc::new(move || {
            if let Some(core) = weak.upgrade() {
                core.handle_full();
            }
        }));

        info!(
            endpoint = %settings.endpoint,
            dir = %settings.storage_dir.display(),
            buffer_capacity = core.buffer.capacity(),
            max_backlog_items = settings.max_backlog_items,
            "Telemetry channel created"
        );

        Ok(Self { core })
    }

    /// Initialize the working directory now instead of on the first flush,
    /// surfacing a directory that cannot be created.
    pub async fn prepare(&self) -> OutboxResult<()> {
        self.core.working_dir.ensure_ready().await.map(|_| ())
    }

    /// Buffer an item. Never waits on I/O.
    pub fn send(&self, item: TelemetryItem) {
        self.core.buffer.enqueue(item);
    }

    /// Cut a batch from whatever is buffered now.
    pub fn flush(&self) {
        self.core.buffer.flush();
    }

    /// Stop accepting transmissions. Waiting and later batches are abandoned;
    /// an attempt already in flight finishes.
    pub fn dispose(&self) {
        if !self.core.disposed.swap(true, Ordering::AcqRel) {
            self.core.transmitter.close();
            debug!("Telemetry channel disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::Acquire)
    }

    /// Wait until every transmission and sweep spawned so far has finished.
    pub async fn wait_for_background_tasks(&self) {
        self.core.tasks.close();
        self.core.tasks.wait().await;
        self.core.tasks.reopen();
    }

    /// Items this channel has quarantined over its lifetime.
    pub fn backlog_items(&self) -> usize {
        self.core.backlog.items()
    }

    pub fn working_dir(&self) -> &Path {
        self.core.working_dir.path()
    }

    /// Cancelled on host shutdown; cancelling it stops backlog retries.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.core.working_dir.shutdown_token().clone()
    }

    pub fn stats(&self) -> ChannelStats {
        let core = &self.core;
        let counters = &core.counters;
        ChannelStats {
            buffered: core.buffer.len(),
            backlog_items: core.backlog.items(),
            max_backlog_items: core.backlog.max_items(),
            batches_delivered: counters.delivered.load(Ordering::Relaxed),
            batches_quarantined: counters.quarantined.load(Ordering::Relaxed),
            batches_dropped: counters.dropped.load(Ordering::Relaxed),
            batches_abandoned: counters.abandoned.load(Ordering::Relaxed),
            batches_failed: counters.failed.load(Ordering::Relaxed),
            sweeps: counters.sweeps.load(Ordering::Relaxed),
            sweeping: core.sweeper.is_running(),
            disposed: core.disposed.load(Ordering::Acquire),
        }
    }
}

impl ChannelCore {
    fn handle_full(self: &Arc<Self>) {
        let batch = self.buffer.dequeue();
        if !batch.is_empty() {
            let core = self.clone();
            self.spawn_guarded("transmit", async move {
                let outcome = core.transmitter.transmit(batch).await;
                core.counters.record(outcome);
            });
        }

        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if let Some(guard) = self.sweeper.try_begin() {
            let core = self.clone();
            self.spawn_guarded("sweep", async move {
                let cancel = core.working_dir.shutdown_token().clone();
                core.sweeper.sweep(guard, &cancel).await;
                core.counters.sweeps.fetch_add(1, Ordering::Relaxed);
            });
        }
    }

    fn spawn_guarded<F>(&self, task: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn_on(
            async move {
                if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
                    error!(task, panic = %panic_message(panic.as_ref()), "Background task panicked");
                }
            },
            &self.runtime,
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

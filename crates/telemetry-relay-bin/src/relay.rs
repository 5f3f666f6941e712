//! Relay loop: JSON lines in, telemetry batches out.

use std::path::Path;

use telemetry_config_and_utils::{Config, Paths};
use telemetry_outbox::{ChannelSettings, TelemetryChannel, TelemetryItem};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Counts for one relay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Events handed to the channel.
    pub sent: usize,
    /// Lines that were not JSON.
    pub skipped: usize,
    /// Input stopped early on shutdown.
    pub interrupted: bool,
}

/// Relay `input` (stdin when `None`) to the configured endpoint.
pub async fn run(
    config: &Config,
    paths: &Paths,
    input: Option<&Path>,
) -> Result<RelayReport, Box<dyn std::error::Error>> {
    let mut settings = ChannelSettings::from_config(config, paths)?;
    settings.install_shutdown_hook = true;
    let channel = TelemetryChannel::with_http(settings)?;
    channel.prepare().await?;
    let shutdown = channel.shutdown_token();

    info!(
        endpoint = %config.endpoint_address,
        dir = %channel.working_dir().display(),
        "Relay started"
    );

    let report = match input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            relay_lines(&channel, BufReader::new(file), &shutdown).await?
        }
        None => relay_lines(&channel, BufReader::new(tokio::io::stdin()), &shutdown).await?,
    };

    tokio::select! {
        _ = channel.wait_for_background_tasks() => {}
        _ = shutdown.cancelled() => {
            warn!("Interrupted, undelivered batches stay on disk for the next run");
        }
    }
    channel.dispose();

    let stats = channel.stats();
    info!(
        sent = report.sent,
        skipped = report.skipped,
        delivered = stats.batches_delivered,
        quarantined = stats.batches_quarantined,
        dropped = stats.batches_dropped,
        abandoned = stats.batches_abandoned,
        "Relay finished"
    );
    Ok(report)
}

/// Send every JSON line of `reader`, then flush what is left in the buffer.
pub async fn relay_lines<R>(
    channel: &TelemetryChannel,
    reader: R,
    shutdown: &CancellationToken,
) -> std::io::Result<RelayReport>
where
    R: AsyncBufRead + Unpin,
{
    let mut report = RelayReport::default();
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                report.interrupted = true;
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        line_no += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(value) => {
                channel.send(TelemetryItem::from_json(value));
                report.sent += 1;
            }
            Err(err) => {
                warn!(line = line_no, error = %err, "Skipping line that is not JSON");
                report.skipped += 1;
            }
        }
    }

    channel.flush();
    Ok(report)
}

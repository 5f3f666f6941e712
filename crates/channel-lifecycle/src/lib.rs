//! Shutdown hooks for the telemetry channel.
//!
//! The channel's background work checks a [`CancellationToken`] between units
//! of work. This crate links that token to the host process: when the process
//! receives Ctrl-C (or SIGTERM on Unix) the token is cancelled.

use std::future::Future;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Errors from lifecycle management.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("No Tokio runtime available to install the shutdown hook")]
    NoRuntime,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a shutdown hook stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The process received a termination signal.
    Signal,
    /// The token was cancelled by its owner first.
    Cancelled,
}

/// Resolves when the process is asked to terminate.
pub async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Cancel `token` once `signal` resolves. Returns early if the token is
/// cancelled by someone else.
pub async fn cancel_on<F>(token: CancellationToken, signal: F) -> ShutdownReason
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        _ = token.cancelled() => ShutdownReason::Cancelled,
        result = signal => {
            match result {
                Ok(()) => info!("Shutdown signal received, cancelling background retries"),
                Err(err) => debug!(error = %err, "Shutdown signal listener failed, cancelling"),
            }
            token.cancel();
            ShutdownReason::Signal
        }
    }
}

/// Spawn a task that cancels `token` on process shutdown.
///
/// Must be called from within a Tokio runtime.
pub fn install_shutdown_hook(
    token: CancellationToken,
) -> Result<JoinHandle<ShutdownReason>, LifecycleError> {
    let handle = tokio::runtime::Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;
    Ok(handle.spawn(cancel_on(token, shutdown_signal())))
}

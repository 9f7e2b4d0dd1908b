//! # Shutdown Signals
//!
//! Kubernetes stops a pod with SIGTERM, a terminal sends SIGINT. Both start
//! the graceful shutdown: readiness drops and the queue drains.

use anyhow::Result;
use std::future::Future;
use tracing::info;

/// Install the signal handlers and return a future that resolves on the first signal
///
/// Handlers are registered before this returns, so a signal that arrives
/// before the future is polled is not lost.
#[cfg(unix)]
pub fn shutdown_signal() -> Result<impl Future<Output = ()> + Send> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM (pod termination), initiating graceful shutdown...");
            }
        }
    })
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> Result<impl Future<Output = ()> + Send> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
        }
        info!("Received Ctrl+C, initiating graceful shutdown...");
    })
}

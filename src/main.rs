//! # Pod Refresher Controller
//!
//! Restarts the pods of a `CertManagerDeployment` when the certificate secret
//! they consume changes, a bounded number at a time.

use anyhow::Result;
use pod_refresher_controller::runtime::{initialize, run_watchers, run_workers, shutdown_signal};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;
    let signal = shutdown_signal()?;

    let watchers = tokio::spawn(run_watchers(
        init.client.clone(),
        init.queue.clone(),
        Arc::clone(&init.index),
        Arc::clone(&init.config),
    ));

    let server_state = Arc::clone(&init.server_state);
    let shutdown = async move {
        signal.await;
        server_state.set_ready(false);
    };

    init.server_state.set_ready(true);
    info!("Controller ready, processing resources");

    run_workers(
        Arc::clone(&init.reconciler),
        init.queue.clone(),
        init.config.max_concurrent_reconciliations,
        shutdown,
    )
    .await;

    watchers.abort();
    info!("Controller stopped gracefully");
    Ok(())
}

//! # Workers
//!
//! Fixed pool of worker loops draining the reconcile queue.
//!
//! Each worker runs `get → reconcile → error policy → done`. The queue hands a
//! key to one worker at a time, so reconciliations of the same resource never
//! overlap while different resources proceed in parallel.

use crate::controller::queue::WorkQueue;
use crate::controller::reconciler::{Reconciler, ReconcilerError};
use crate::observability::metrics;
use crate::runtime::error_policy::handle_result;
use crate::store::ObjectKey;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, Instrument};

/// Run `workers` worker loops until `shutdown` resolves
///
/// On shutdown the queue stops handing out new keys, in-flight
/// reconciliations finish and the workers are joined before returning.
pub async fn run_workers<F>(
    reconciler: Arc<Reconciler>,
    queue: WorkQueue<ObjectKey>,
    workers: usize,
    shutdown: F,
) where
    F: Future<Output = ()>,
{
    let workers = workers.max(1);
    info!("Starting {workers} reconcile workers");

    let handles: Vec<_> = (0..workers)
        .map(|id| {
            let reconciler = Arc::clone(&reconciler);
            let queue = queue.clone();
            tokio::spawn(
                worker_loop(reconciler, queue)
                    .instrument(tracing::info_span!("controller.worker", worker = id)),
            )
        })
        .collect();

    shutdown.await;
    info!("Shutdown requested, waiting for in-flight reconciliations to complete...");
    queue.shutdown_with_drain().await;

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Worker task failed: {e}");
        }
    }
    info!("Workers stopped gracefully");
}

async fn worker_loop(reconciler: Arc<Reconciler>, queue: WorkQueue<ObjectKey>) {
    while let Some(key) = queue.get().await {
        metrics::set_queue_depth(queue.len());
        process_key(&reconciler, &queue, &key).await;
        queue.done(&key);
    }
}

/// Reconcile one key and apply the error policy to the result
pub async fn process_key(reconciler: &Reconciler, queue: &WorkQueue<ObjectKey>, key: &ObjectKey) {
    let started = Instant::now();
    let result = AssertUnwindSafe(reconciler.reconcile_with_timeout(key))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!(resource = %key, "Reconciliation panicked");
            Err(ReconcilerError::Panicked)
        });
    metrics::observe_reconciliation_duration(started.elapsed().as_secs_f64());
    handle_result(queue, key, &result);
}

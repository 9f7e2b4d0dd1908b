//! # Error Policy
//!
//! Decides what happens to a key after its reconciliation returns, and how
//! watch stream errors are handled.
//!
//! | Outcome | Queue action | Requeue reason |
//! |---|---|---|
//! | `RefreshInProgress` | `add_after(poll interval)` | `refresh-poll` |
//! | `Degraded` | `add_after(Fibonacci delay)` | `degraded-backoff` |
//! | other successes | `forget` | - |
//! | transient error | `add_rate_limited` | `error-backoff` |
//! | fatal error | `forget` | - |

use crate::controller::queue::WorkQueue;
use crate::controller::reconciler::{
    ErrorKind, ReconcileOutcome, ReconcileResult, ReconcilerError,
};
use crate::observability::metrics;
use crate::store::ObjectKey;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info, warn, Instrument};

/// What the error policy did with a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    /// Scheduled again after the given delay
    Requeued(Duration),
    /// Not scheduled; the next watch event brings it back
    Forgotten,
}

/// Apply the error policy to the result of one reconciliation
pub fn handle_result(
    queue: &WorkQueue<ObjectKey>,
    key: &ObjectKey,
    result: &Result<ReconcileOutcome, ReconcilerError>,
) -> QueueAction {
    match result {
        Ok(outcome) => handle_outcome(queue, key, *outcome),
        Err(e) => handle_reconciliation_error(queue, key, e),
    }
}

fn handle_outcome(
    queue: &WorkQueue<ObjectKey>,
    key: &ObjectKey,
    outcome: ReconcileOutcome,
) -> QueueAction {
    metrics::increment_reconciliations(outcome.result.as_str());
    queue.forget(key);

    let reason = match outcome.result {
        ReconcileResult::Degraded => {
            metrics::increment_reconciliation_errors(ErrorKind::Degraded.as_str());
            "degraded-backoff"
        }
        _ => "refresh-poll",
    };

    match outcome.requeue_after {
        Some(delay) => {
            metrics::increment_requeues(reason);
            queue.add_after(key.clone(), delay);
            QueueAction::Requeued(delay)
        }
        None => QueueAction::Forgotten,
    }
}

/// Handle a reconciliation error
///
/// Transient errors back off exponentially per key, tracked by the queue so
/// one failing resource never slows down the others. Fatal errors are not
/// retried: the resource comes back on its next change.
pub fn handle_reconciliation_error(
    queue: &WorkQueue<ObjectKey>,
    key: &ObjectKey,
    error: &ReconcilerError,
) -> QueueAction {
    let kind = error.kind();
    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.reconciliation_error",
        resource = %key,
        kind = kind.as_str(),
        error = %error
    );
    let _error_guard = error_span.enter();

    metrics::increment_reconciliation_errors(kind.as_str());

    match kind {
        ErrorKind::Fatal => {
            error!("Reconciliation of {key} failed and will not be retried: {error}");
            queue.forget(key);
            QueueAction::Forgotten
        }
        ErrorKind::Transient | ErrorKind::Degraded => {
            let delay = queue.add_rate_limited(key.clone());
            metrics::increment_requeues("error-backoff");
            warn!("Reconciliation error for {key}: {error}");
            info!(
                "🔄 Retrying in {}ms (attempt: {}, trigger source: error-backoff)",
                delay.as_millis(),
                queue.num_requeues(key)
            );
            QueueAction::Requeued(delay)
        }
    }
}

/// Watch stream error classes, checked in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorClass {
    NotFound,
    Unauthorized,
    Expired,
    Throttled,
    Other,
}

/// Classify a watch stream error by its message
///
/// 404 is checked before 401 since a plain text 404 body surfaces as a
/// decode error mentioning `WatchFailed`.
#[must_use]
pub fn classify_watch_error(error_string: &str) -> WatchErrorClass {
    let is_not_found = error_string.contains("ObjectNotFound")
        || error_string.contains("404")
        || error_string.contains("not found");
    if is_not_found {
        return WatchErrorClass::NotFound;
    }
    if error_string.contains("401") || error_string.contains("Unauthorized") {
        return WatchErrorClass::Unauthorized;
    }
    if error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone")
    {
        return WatchErrorClass::Expired;
    }
    if error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests")
    {
        return WatchErrorClass::Throttled;
    }
    WatchErrorClass::Other
}

/// Handle a watch stream error, sleeping where the class calls for it
///
/// Returns `true` when the stream should keep going and `false` when the
/// watch should be restarted.
pub async fn handle_watch_stream_error(
    watch: &str,
    error_string: &str,
    backoff: &AtomicU64,
    max_backoff_ms: u64,
    watch_restart_delay: Duration,
) -> bool {
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        watch = watch,
        error = %error_string
    );

    // Instrumented rather than entered: the guard must not live across the sleeps
    async move {
        match classify_watch_error(error_string) {
            WatchErrorClass::NotFound => {
                warn!(
                    "{watch} watch returned not found (404), the CRD may be missing. Error: {error_string}"
                );
                true
            }
            WatchErrorClass::Unauthorized => {
                error!(
                    "❌ {watch} watch authentication failed (401 Unauthorized) - RBAC may have been revoked or token expired"
                );
                error!("   Verify access with: kubectl auth can-i watch {watch} --as=system:serviceaccount:<namespace>:pod-refresher-controller");
                warn!(
                    "⏳ Waiting {}s before retrying watch...",
                    watch_restart_delay.as_secs()
                );
                tokio::time::sleep(watch_restart_delay).await;
                false
            }
            WatchErrorClass::Expired => {
                warn!(error_type = "410", "{watch} watch resource version expired, restarting");
                false
            }
            WatchErrorClass::Throttled => {
                let current_backoff = backoff.load(Ordering::Relaxed);
                warn!(
                    "API server throttling {watch} watch (429), backing off for {current_backoff}ms before restart..."
                );
                tokio::time::sleep(Duration::from_millis(current_backoff)).await;
                backoff.store(
                    current_backoff.saturating_mul(2).min(max_backoff_ms),
                    Ordering::Relaxed,
                );
                false
            }
            WatchErrorClass::Other => {
                error!("{watch} watch stream error: {error_string}");
                tokio::time::sleep(watch_restart_delay).await;
                false
            }
        }
    }
    .instrument(error_span)
    .await
}

//! # Reconciliation
//!
//! Per-resource reconciliation: compares the referenced secret's fingerprint
//! with the fingerprint stamped into the selected pods and restarts the stale
//! ones within the availability budget.
//!
//! ```text
//! Idle ──fingerprint change──▶ Detected ──executor──▶ Refreshing ──all current──▶ Idle
//!   └─ secret missing/malformed ─▶ Degraded (slow backoff, self-heals)
//!   └─ invalid spec ─▶ Failed (until the generation changes)
//! ```

use crate::controller::backoff::FibonacciBackoff;
use crate::controller::fingerprint::{fingerprint_secret, missing_keys, Fingerprint};
use crate::controller::refresh::{PodRefreshTarget, RefreshStatus};
use crate::controller::reconciler::status::{now_rfc3339, DesiredStatus, StatusReporter};
use crate::controller::reconciler::types::{
    ReconcileOutcome, ReconcileResult, Reconciler, ReconcilerError, TrackedSecretState,
};
use crate::controller::reconciler::validation::validate_deployment;
use crate::crd::{CertManagerDeployment, RefreshState};
use crate::observability::metrics;
use crate::store::{get_typed, list_typed, ObjectKey, StoreError};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::ResourceExt;
use tracing::{debug, info, info_span, warn, Instrument};

/// Tracked state checked out of the reconciler for one reconciliation
///
/// The state goes back into the map when the lease is dropped, including when
/// the reconciliation future is cancelled by a timeout. Clearing `state`
/// drops it for good.
struct StateLease<'a> {
    reconciler: &'a Reconciler,
    key: ObjectKey,
    state: Option<TrackedSecretState>,
}

impl Drop for StateLease<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.reconciler.put_state(self.key.clone(), state);
        }
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    reason = "pod counts fit in the i32 status field"
)]
fn count(n: usize) -> i32 {
    n.min(i32::MAX as usize) as i32
}

impl Reconciler {
    /// Reconcile one resource key
    ///
    /// Status write conflicts re-run the whole reconciliation against freshly
    /// read objects, up to `max_conflict_retries` times.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcilerError> {
        let span = info_span!("reconcile", resource = %key);
        async {
            let mut lease = StateLease {
                reconciler: self,
                key: key.clone(),
                state: self.take_state(key),
            };

            let max_retries = self.config.max_conflict_retries;
            let mut attempt = 0;
            loop {
                match self.reconcile_once(key, &mut lease.state).await {
                    Err(ReconcilerError::Store(StoreError::Conflict(what))) => {
                        metrics::increment_status_conflicts();
                        if attempt >= max_retries {
                            return Err(ReconcilerError::ConflictRetriesExhausted {
                                key: key.clone(),
                                attempts: attempt + 1,
                            });
                        }
                        attempt += 1;
                        debug!(attempt, "Conflict writing {what}, retrying with fresh state");
                    }
                    other => return other,
                }
            }
        }
        .instrument(span)
        .await
    }

    /// [`Self::reconcile`] bounded by the configured reconcile timeout
    pub async fn reconcile_with_timeout(
        &self,
        key: &ObjectKey,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        let timeout = self.config.reconcile_timeout();
        tokio::time::timeout(timeout, self.reconcile(key))
            .await
            .unwrap_or(Err(ReconcilerError::Timeout(timeout)))
    }

    async fn reconcile_once(
        &self,
        key: &ObjectKey,
        state: &mut Option<TrackedSecretState>,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        let store = self.store.as_ref();
        let registry = self.registry.as_ref();

        let Some(resource) = get_typed::<CertManagerDeployment>(store, registry, key).await? else {
            if state.take().is_some() {
                info!("Resource deleted, dropping tracked state");
            }
            return Ok(ReconcileOutcome::done(ReconcileResult::NoOp));
        };
        let reporter = StatusReporter::new(store, registry.resolve::<CertManagerDeployment>()?);
        let status = resource.status.as_ref();

        if status.and_then(|s| s.state()) == Some(RefreshState::Failed)
            && status.and_then(|s| s.observed_generation) == resource.metadata.generation
        {
            debug!("Spec unchanged since it failed validation, skipping");
            return Ok(ReconcileOutcome::done(ReconcileResult::NoOp));
        }

        let spec = match validate_deployment(&resource, &self.config) {
            Ok(spec) => spec,
            Err(e) => {
                warn!("Invalid spec: {e}");
                if let Some(tracked) = state.as_mut() {
                    tracked.state = RefreshState::Failed;
                }
                let desired = DesiredStatus {
                    state: RefreshState::Failed,
                    message: e.to_string(),
                    observed_fingerprint: status.and_then(|s| s.observed_fingerprint.clone()),
                    last_refresh_time: status.and_then(|s| s.last_refresh_time.clone()),
                    stale_pods: status.and_then(|s| s.stale_pods),
                };
                reporter.report(&resource, &desired).await?;
                return Ok(ReconcileOutcome::done(ReconcileResult::Failed));
            }
        };

        let secret_key = ObjectKey::new(key.namespace.clone(), spec.secret_name.clone());
        let tracked = state.get_or_insert_with(|| {
            TrackedSecretState::seeded(
                secret_key.clone(),
                status,
                FibonacciBackoff::new(
                    self.config.degraded_requeue_secs,
                    self.config.degraded_requeue_max_secs,
                ),
            )
        });
        if tracked.secret != secret_key {
            info!(secret = %secret_key, "Certificate secret reference changed");
            tracked.secret = secret_key.clone();
            tracked.observed_version = None;
            tracked.requested.clear();
        }

        let secret = get_typed::<Secret>(store, registry, &secret_key).await?;
        let fingerprint = fingerprint_secret(secret.as_ref());
        tracked.observed_version = secret.as_ref().and_then(|s| s.resource_version());
        if fingerprint != tracked.fingerprint {
            debug!(secret = %secret_key, fingerprint = %fingerprint, "Observed secret fingerprint");
            tracked.fingerprint = fingerprint.clone();
        }

        let degraded = match (&secret, &fingerprint) {
            (Some(secret), Fingerprint::Digest(digest)) => {
                let missing = missing_keys(secret, &self.config.required_secret_keys);
                if missing.is_empty() {
                    Ok(digest.clone())
                } else {
                    Err(format!(
                        "Secret {secret_key} is missing required keys: {}",
                        missing.join(", ")
                    ))
                }
            }
            _ => Err(format!("Secret {secret_key} not found")),
        };
        let current = match degraded {
            Ok(current) => current,
            Err(reason) => {
                tracked.state = RefreshState::Degraded;
                let desired = DesiredStatus {
                    state: RefreshState::Degraded,
                    message: reason.clone(),
                    observed_fingerprint: tracked.last_applied.clone(),
                    last_refresh_time: tracked.last_refresh_time.clone(),
                    stale_pods: status.and_then(|s| s.stale_pods),
                };
                reporter.report(&resource, &desired).await?;
                // Only a written status advances the backoff; conflicts re-run this pass
                let delay = tracked.degraded_backoff.next_backoff();
                warn!(
                    secret = %secret_key,
                    attempt = tracked.degraded_backoff.attempts(),
                    "{reason}, retrying in {}s",
                    delay.as_secs()
                );
                return Ok(ReconcileOutcome::requeue(ReconcileResult::Degraded, delay));
            }
        };
        if tracked.state == RefreshState::Degraded {
            info!(secret = %secret_key, "Certificate secret available again");
        }
        tracked.degraded_backoff.reset();

        let pods = list_typed::<Pod>(store, registry, &key.namespace, &spec.selector).await?;
        let targets: Vec<PodRefreshTarget> = pods
            .iter()
            .map(|pod| PodRefreshTarget::from_pod(pod, &self.config.fingerprint_annotation))
            .collect();
        let stale = targets.iter().filter(|t| t.is_stale(&current)).count();

        if tracked.last_applied.as_deref() == Some(current.as_str()) && stale == 0 {
            tracked.state = RefreshState::Idle;
            tracked.requested.clear();
            let desired = idle_status(tracked, targets.len());
            reporter.report(&resource, &desired).await?;
            return Ok(ReconcileOutcome::done(ReconcileResult::NoOp));
        }

        if tracked.state != RefreshState::Refreshing {
            info!(
                fingerprint = %current,
                stale,
                total = targets.len(),
                "Certificate change detected"
            );
            tracked.state = RefreshState::Detected;
        }

        let report = self
            .executor
            .refresh(key, &targets, &current, &mut tracked.requested, &spec.settings)
            .await?;
        if !report.requested.is_empty() {
            tracked.refresh_issued = true;
        }

        match report.status {
            RefreshStatus::InProgress => {
                tracked.state = RefreshState::Refreshing;
                let desired = DesiredStatus {
                    state: RefreshState::Refreshing,
                    message: format!(
                        "{} of {} pods awaiting refresh",
                        report.stale, report.total
                    ),
                    observed_fingerprint: tracked.last_applied.clone(),
                    last_refresh_time: tracked.last_refresh_time.clone(),
                    stale_pods: Some(count(report.stale)),
                };
                reporter.report(&resource, &desired).await?;
                Ok(ReconcileOutcome::requeue(
                    ReconcileResult::RefreshInProgress,
                    self.config.refresh_poll_interval(),
                ))
            }
            RefreshStatus::Complete => {
                let mut desired = idle_status(tracked, report.total);
                let changed = tracked.last_applied.as_deref() != Some(current.as_str());
                if changed {
                    desired.observed_fingerprint = Some(current.clone());
                    // Adopting a fingerprint every pod already runs is not a refresh
                    if tracked.refresh_issued {
                        desired.last_refresh_time = Some(now_rfc3339());
                    }
                }
                // Tracked state only moves once the status write went through
                reporter.report(&resource, &desired).await?;
                if changed {
                    info!(fingerprint = %current, pods = report.total, "Refresh complete");
                    tracked.last_applied = desired.observed_fingerprint;
                    tracked.last_refresh_time = desired.last_refresh_time;
                }
                tracked.refresh_issued = false;
                tracked.state = RefreshState::Idle;
                Ok(ReconcileOutcome::done(ReconcileResult::RefreshComplete))
            }
        }
    }
}

fn idle_status(tracked: &TrackedSecretState, total: usize) -> DesiredStatus {
    DesiredStatus {
        state: RefreshState::Idle,
        message: format!("All {total} selected pods run the current certificate"),
        observed_fingerprint: tracked.last_applied.clone(),
        last_refresh_time: tracked.last_refresh_time.clone(),
        stale_pods: Some(0),
    }
}

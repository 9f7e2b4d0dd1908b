//! # Pod Refresh Executor
//!
//! Restarts pods still running with an outdated certificate, a few at a time.
//!
//! Each pass:
//! 1. prunes the request ledger to pods that still exist
//! 2. computes how many pods may be unavailable (the budget) and how many
//!    already are (terminating, already requested, or replacements that are
//!    not ready yet)
//! 3. deletes or evicts up to the remaining slots, stale pods that are not
//!    ready first, then in pod name order
//!
//! A stale pod that is not ready does not use up the budget: restarting it
//! costs no availability, and a single crashlooping replica must still be
//! restarted.
//!
//! The executor never stamps pods. A replacement picks up the current
//! fingerprint from its workload template; until it does, it stays stale and
//! is picked up again on a later pass once the old one is gone.

use crate::crd::RefreshAction;
use crate::observability::metrics;
use crate::store::{ObjectKey, ResourceStore, StoreError};
use k8s_openapi::api::core::v1::Pod;
use kube::core::ApiResource;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the executor needs to know about one selected pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRefreshTarget {
    pub name: String,
    pub uid: String,
    /// Fingerprint stamped into the pod annotation, if any
    pub stamped: Option<String>,
    pub ready: bool,
    pub terminating: bool,
}

impl PodRefreshTarget {
    /// Build a target from a pod, reading the stamp from `annotation`
    #[must_use]
    pub fn from_pod(pod: &Pod, annotation: &str) -> Self {
        let name = pod.name_any();
        let ready = pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            });
        Self {
            uid: pod.uid().unwrap_or_else(|| name.clone()),
            stamped: pod.annotations().get(annotation).cloned(),
            ready,
            terminating: pod.metadata.deletion_timestamp.is_some(),
            name,
        }
    }

    /// A pod is stale when it carries no stamp or a different one
    #[must_use]
    pub fn is_stale(&self, current: &str) -> bool {
        self.stamped.as_deref() != Some(current)
    }
}

/// Availability limits for one refresh pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshSettings {
    /// Fraction of pods that may be unavailable at once, in (0, 1]
    pub max_unavailable_fraction: f64,
    /// Lower bound on the budget so small workloads still make progress
    pub min_per_cycle: usize,
    pub action: RefreshAction,
}

/// Whether every selected pod is on the current fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    Complete,
    InProgress,
}

/// Outcome of one refresh pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub status: RefreshStatus,
    /// Pods whose deletion was requested in this pass
    pub requested: Vec<String>,
    /// Evictions refused by a disruption budget in this pass
    pub blocked: usize,
    /// Selected pods still on an outdated fingerprint
    pub stale: usize,
    /// Selected pods
    pub total: usize,
}

impl RefreshReport {
    fn complete(total: usize) -> Self {
        Self {
            status: RefreshStatus::Complete,
            requested: Vec::new(),
            blocked: 0,
            stale: 0,
            total,
        }
    }
}

/// Number of pods that may be unavailable at once
///
/// `max(min_per_cycle, floor(total * fraction))`
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    reason = "pod counts are far below f64 precision limits and the fraction is validated to (0, 1]"
)]
pub fn budget(total: usize, fraction: f64, min_per_cycle: usize) -> usize {
    let by_fraction = (total as f64 * fraction).floor().max(0.0) as usize;
    by_fraction.max(min_per_cycle)
}

/// Deletes or evicts stale pods within the availability budget
#[derive(Clone)]
pub struct RefreshExecutor {
    store: Arc<dyn ResourceStore>,
    pods: ApiResource,
}

impl std::fmt::Debug for RefreshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshExecutor")
            .field("pods", &self.pods.kind)
            .finish_non_exhaustive()
    }
}

impl RefreshExecutor {
    /// `pods` is the resolved `Pod` kind from the registry
    pub fn new(store: Arc<dyn ResourceStore>, pods: ApiResource) -> Self {
        Self { store, pods }
    }

    /// Run one refresh pass over the selected pods of `resource`
    ///
    /// `ledger` holds the UIDs of pods whose deletion was already requested
    /// and is updated in place.
    pub async fn refresh(
        &self,
        resource: &ObjectKey,
        targets: &[PodRefreshTarget],
        current: &str,
        ledger: &mut HashSet<String>,
        settings: &RefreshSettings,
    ) -> Result<RefreshReport, StoreError> {
        let present: HashSet<&str> = targets.iter().map(|t| t.uid.as_str()).collect();
        ledger.retain(|uid| present.contains(uid.as_str()));

        let stale: Vec<&PodRefreshTarget> = targets.iter().filter(|t| t.is_stale(current)).collect();
        if stale.is_empty() {
            ledger.clear();
            return Ok(RefreshReport::complete(targets.len()));
        }

        let budget = budget(
            targets.len(),
            settings.max_unavailable_fraction,
            settings.min_per_cycle,
        );
        let unavailable = targets
            .iter()
            .filter(|t| {
                t.terminating
                    || ledger.contains(&t.uid)
                    || (!t.ready && !t.is_stale(current))
            })
            .count();
        let slots = budget.saturating_sub(unavailable);

        let mut candidates: Vec<&PodRefreshTarget> = stale
            .iter()
            .copied()
            .filter(|t| !t.terminating && !ledger.contains(&t.uid))
            .collect();
        candidates.sort_by(|a, b| a.ready.cmp(&b.ready).then_with(|| a.name.cmp(&b.name)));

        debug!(
            resource = %resource,
            total = targets.len(),
            stale = stale.len(),
            budget,
            unavailable,
            slots,
            "Planning pod refresh"
        );

        let mut requested = Vec::new();
        let mut blocked = 0;
        for target in candidates.into_iter().take(slots) {
            let result = match settings.action {
                RefreshAction::Delete => {
                    self.store
                        .delete(&self.pods, &resource.namespace, &target.name)
                        .await
                }
                RefreshAction::Evict => self.store.evict(&resource.namespace, &target.name).await,
            };

            match result {
                Ok(()) => {
                    info!(
                        resource = %resource,
                        pod = %target.name,
                        action = %settings.action,
                        "Requested pod refresh"
                    );
                    metrics::increment_pod_refresh_requests(settings.action);
                    ledger.insert(target.uid.clone());
                    requested.push(target.name.clone());
                }
                Err(StoreError::NotFound(_)) => {
                    debug!(resource = %resource, pod = %target.name, "Pod already gone");
                    ledger.insert(target.uid.clone());
                }
                Err(StoreError::Blocked(reason)) => {
                    warn!(resource = %resource, pod = %target.name, "Eviction blocked: {reason}");
                    metrics::increment_blocked_evictions();
                    blocked += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(RefreshReport {
            status: RefreshStatus::InProgress,
            requested,
            blocked,
            stale: stale.len(),
            total: targets.len(),
        })
    }
}

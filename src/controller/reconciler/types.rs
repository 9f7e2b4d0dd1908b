//! # Reconciler Types
//!
//! Core types for the reconciler: the reconciler itself, per-resource
//! tracked state, reconciliation outcomes and errors.

use crate::config::SharedControllerConfig;
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::fingerprint::Fingerprint;
use crate::controller::refresh::RefreshExecutor;
use crate::crd::{CertManagerDeploymentStatus, RefreshState};
use crate::registry::KindRegistry;
use crate::store::{ObjectKey, ResourceStore, StoreError};
use k8s_openapi::api::core::v1::Pod;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Error classes used by the error policy and in metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retried with exponential backoff
    Transient,
    /// Referenced secret missing or malformed; retried slowly
    Degraded,
    /// Not retried until the spec changes
    Fatal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Degraded => "degraded",
            ErrorKind::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reconciliation timed out after {0:?}")]
    Timeout(Duration),
    #[error("status of {key} kept conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { key: ObjectKey, attempts: u32 },
    #[error("reconciliation panicked")]
    Panicked,
}

impl ReconcilerError {
    /// Classify the error for the error policy
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcilerError::Store(
                StoreError::Fatal(_) | StoreError::Decode(_) | StoreError::UnregisteredKind(_),
            ) => ErrorKind::Fatal,
            ReconcilerError::Store(_)
            | ReconcilerError::Timeout(_)
            | ReconcilerError::ConflictRetriesExhausted { .. }
            | ReconcilerError::Panicked => ErrorKind::Transient,
        }
    }
}

/// What a successful reconciliation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Nothing to do: resource gone, already converged, or terminally failed
    NoOp,
    /// Stale pods remain; check again after the poll interval
    RefreshInProgress,
    /// Every selected pod runs with the current certificate
    RefreshComplete,
    /// Referenced secret missing or malformed
    Degraded,
    /// Spec cannot be reconciled until it changes
    Failed,
}

impl ReconcileResult {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileResult::NoOp => "noop",
            ReconcileResult::RefreshInProgress => "refresh_in_progress",
            ReconcileResult::RefreshComplete => "refresh_complete",
            ReconcileResult::Degraded => "degraded",
            ReconcileResult::Failed => "failed",
        }
    }
}

/// Result of one reconciliation plus an optional requeue delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub result: ReconcileResult,
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    #[must_use]
    pub fn done(result: ReconcileResult) -> Self {
        Self {
            result,
            requeue_after: None,
        }
    }

    #[must_use]
    pub fn requeue(result: ReconcileResult, after: Duration) -> Self {
        Self {
            result,
            requeue_after: Some(after),
        }
    }
}

/// Per-resource state owned by the worker holding the resource key
#[derive(Debug, Clone)]
pub struct TrackedSecretState {
    /// Referenced secret
    pub secret: ObjectKey,
    pub fingerprint: Fingerprint,
    /// Resource version of the secret when it was last read
    pub observed_version: Option<String>,
    /// Fingerprint every selected pod was last confirmed to run with
    pub last_applied: Option<String>,
    pub last_refresh_time: Option<String>,
    pub state: RefreshState,
    /// UIDs of pods whose deletion was already requested
    pub requested: HashSet<String>,
    /// Whether any pod was restarted for the fingerprint being rolled out
    pub refresh_issued: bool,
    pub degraded_backoff: FibonacciBackoff,
}

impl TrackedSecretState {
    /// Fresh state, seeded from the persisted status so a restart does not
    /// look like a certificate change
    #[must_use]
    pub fn seeded(
        secret: ObjectKey,
        status: Option<&CertManagerDeploymentStatus>,
        degraded_backoff: FibonacciBackoff,
    ) -> Self {
        let state = status
            .and_then(CertManagerDeploymentStatus::state)
            .unwrap_or(RefreshState::Idle);
        Self {
            secret,
            fingerprint: Fingerprint::Absent,
            observed_version: None,
            last_applied: status.and_then(|s| s.observed_fingerprint.clone()),
            last_refresh_time: status.and_then(|s| s.last_refresh_time.clone()),
            state,
            requested: HashSet::new(),
            // A rollout interrupted by a restart already restarted pods
            refresh_issued: state == RefreshState::Refreshing,
            degraded_backoff,
        }
    }
}

/// Reconciler for `CertManagerDeployment` resources
pub struct Reconciler {
    pub(crate) store: Arc<dyn ResourceStore>,
    pub(crate) registry: Arc<KindRegistry>,
    pub(crate) config: SharedControllerConfig,
    pub(crate) executor: RefreshExecutor,
    tracked: Mutex<HashMap<ObjectKey, TrackedSecretState>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Build a reconciler over a store and a registry
    ///
    /// Fails when the registry is missing a kind the reconciler needs.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: Arc<KindRegistry>,
        config: SharedControllerConfig,
    ) -> Result<Self, StoreError> {
        let pods = registry.resolve::<Pod>()?.clone();
        let executor = RefreshExecutor::new(Arc::clone(&store), pods);
        Ok(Self {
            store,
            registry,
            config,
            executor,
            tracked: Mutex::new(HashMap::new()),
        })
    }

    fn tracked_states(&self) -> MutexGuard<'_, HashMap<ObjectKey, TrackedSecretState>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a key's state out of the map for the duration of a reconciliation
    pub(crate) fn take_state(&self, key: &ObjectKey) -> Option<TrackedSecretState> {
        self.tracked_states().remove(key)
    }

    pub(crate) fn put_state(&self, key: ObjectKey, state: TrackedSecretState) {
        self.tracked_states().insert(key, state);
    }

    /// Copy of the tracked state for a key
    #[must_use]
    pub fn tracked_state(&self, key: &ObjectKey) -> Option<TrackedSecretState> {
        self.tracked_states().get(key).cloned()
    }

    /// Number of resources with tracked state
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.tracked_states().len()
    }

    #[must_use]
    pub fn config(&self) -> &SharedControllerConfig {
        &self.config
    }
}

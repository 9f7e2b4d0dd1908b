//! # Status Reporter
//!
//! Writes refresh outcomes to the `CertManagerDeployment` status subresource.
//!
//! Writes are skipped when nothing changed, so a converged resource does not
//! generate watch events. Every write is a compare-and-write against the
//! resource version the reconciliation read; a concurrent modification
//! surfaces as `StoreError::Conflict` and the reconciler starts over.

use crate::crd::{CertManagerDeployment, CertManagerDeploymentStatus, RefreshCondition, RefreshState};
use crate::store::{ResourceStore, StoreError};
use kube::core::ApiResource;
use kube::ResourceExt;
use tracing::debug;

/// Status the reconciler wants to see on the resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredStatus {
    pub state: RefreshState,
    pub message: String,
    pub observed_fingerprint: Option<String>,
    pub last_refresh_time: Option<String>,
    pub stale_pods: Option<i32>,
}

/// Current time in the RFC3339 form used for status timestamps
#[must_use]
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Build the full status from the desired fields
///
/// `lastTransitionTime` is carried over while the condition type stays the same.
#[must_use]
pub fn build_status(
    resource: &CertManagerDeployment,
    desired: &DesiredStatus,
    now: &str,
) -> CertManagerDeploymentStatus {
    let previous = resource.status.as_ref().and_then(|s| s.condition.as_ref());
    let last_transition_time = match previous {
        Some(condition) if condition.r#type == desired.state => condition
            .last_transition_time
            .clone()
            .or_else(|| Some(now.to_string())),
        _ => Some(now.to_string()),
    };

    CertManagerDeploymentStatus {
        observed_fingerprint: desired.observed_fingerprint.clone(),
        last_refresh_time: desired.last_refresh_time.clone(),
        observed_generation: resource.metadata.generation,
        stale_pods: desired.stale_pods,
        condition: Some(RefreshCondition {
            r#type: desired.state,
            message: Some(desired.message.clone()),
            last_transition_time,
        }),
    }
}

/// Writes status through a [`ResourceStore`]
pub struct StatusReporter<'a> {
    store: &'a dyn ResourceStore,
    kind: &'a ApiResource,
}

impl std::fmt::Debug for StatusReporter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("kind", &self.kind.kind)
            .finish_non_exhaustive()
    }
}

impl<'a> StatusReporter<'a> {
    #[must_use]
    pub fn new(store: &'a dyn ResourceStore, kind: &'a ApiResource) -> Self {
        Self { store, kind }
    }

    /// Write the desired status, returning whether a write happened
    pub async fn report(
        &self,
        resource: &CertManagerDeployment,
        desired: &DesiredStatus,
    ) -> Result<bool, StoreError> {
        let status = build_status(resource, desired, &now_rfc3339());
        if resource.status.as_ref() == Some(&status) {
            debug!(
                resource = %resource.name_any(),
                state = %desired.state,
                "Skipping status update - unchanged"
            );
            return Ok(false);
        }

        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_any();
        let expected_version = resource.resource_version().unwrap_or_default();
        self.store
            .update_status(
                self.kind,
                &namespace,
                &name,
                &expected_version,
                serde_json::to_value(&status)?,
            )
            .await?;
        debug!(
            resource = %name,
            state = %desired.state,
            message = %desired.message,
            "Updated status"
        );
        Ok(true)
    }
}

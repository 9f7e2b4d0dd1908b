//! # CertManagerDeployment Status
//!
//! Status types written by the pod refresher.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of the CertManagerDeployment resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertManagerDeploymentStatus {
    /// Fingerprint of the certificate secret every selected pod was last refreshed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_fingerprint: Option<String>,
    /// Time the last refresh completed (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_time: Option<String>,
    /// Generation of the spec this status was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Number of selected pods still carrying an outdated fingerprint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_pods: Option<i32>,
    /// Current refresh condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<RefreshCondition>,
}

/// Refresh condition reported on the status subresource
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshCondition {
    /// Refresh state the resource is in
    pub r#type: RefreshState,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last time the condition type changed (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Per-resource refresh state
///
/// `Detected` only exists inside a single reconciliation and is never
/// written to the status subresource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema)]
pub enum RefreshState {
    /// Every selected pod runs with the current certificate
    Idle,
    /// A fingerprint change was observed
    Detected,
    /// Stale pods are being replaced
    Refreshing,
    /// The referenced secret is missing or malformed
    Degraded,
    /// The spec cannot be reconciled until it changes
    Failed,
}

impl RefreshState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshState::Idle => "Idle",
            RefreshState::Detected => "Detected",
            RefreshState::Refreshing => "Refreshing",
            RefreshState::Degraded => "Degraded",
            RefreshState::Failed => "Failed",
        }
    }
}

impl fmt::Display for RefreshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CertManagerDeploymentStatus {
    /// Condition type currently reported, if any
    #[must_use]
    pub fn state(&self) -> Option<RefreshState> {
        self.condition.as_ref().map(|c| c.r#type)
    }
}

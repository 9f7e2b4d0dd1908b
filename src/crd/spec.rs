//! # CertManagerDeployment Spec
//!
//! The custom resource tracked by the pod refresher, plus the pieces of its
//! spec the refresher reads: the certificate reference, the pod selector and
//! the refresh policy.

use crate::crd::status::CertManagerDeploymentStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// CertManagerDeployment Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: operators.opdev.io/v1alpha1
/// kind: CertManagerDeployment
/// metadata:
///   name: cluster
///   namespace: cert-manager
/// spec:
///   version: v1.3.1
///   certificate:
///     issuer: selfsigned-issuer
///     secretName: tls-secret
///   podSelector:
///     matchLabels:
///       app: webhook
///   refresh:
///     maxUnavailableFraction: 0.5
/// ```
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "CertManagerDeployment",
    group = "operators.opdev.io",
    version = "v1alpha1",
    namespaced,
    status = "CertManagerDeploymentStatus",
    shortname = "cmd",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.condition.type"}"#,
    printcolumn = r#"{"name":"Fingerprint", "type":"string", "jsonPath":".status.observedFingerprint", "priority": 1}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CertManagerDeploymentSpec {
    /// cert-manager version deployed by the operator
    #[serde(default)]
    pub version: Option<String>,
    /// Certificate whose secret is tracked for rotation
    pub certificate: CertificateRef,
    /// Pods consuming the certificate secret
    #[serde(default)]
    pub pod_selector: PodSelector,
    /// Refresh policy overrides (controller defaults apply when unset)
    #[serde(default)]
    pub refresh: Option<RefreshPolicy>,
}

/// Reference to the issuer and the secret backing a certificate
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRef {
    /// Name of the issuer signing the certificate
    pub issuer: String,
    /// Secret in the resource namespace holding the certificate bundle
    pub secret_name: String,
}

/// Label selector for the pods consuming the certificate
///
/// Mirrors the Kubernetes `LabelSelector` shape. Operators are kept as plain
/// strings so that an invalid operator is reported on the resource instead of
/// being rejected at decode time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<SelectorRequirement>>,
}

/// A single set-based selector requirement
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRequirement {
    pub key: String,
    /// One of `In`, `NotIn`, `Exists`, `DoesNotExist`
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

/// Per-resource refresh policy
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshPolicy {
    /// Fraction of pods that may be unavailable at once, in (0, 1]
    #[serde(default)]
    pub max_unavailable_fraction: Option<f64>,
    /// How stale pods are taken down
    #[serde(default)]
    pub action: Option<RefreshAction>,
}

/// How a stale pod is taken down so its workload controller recreates it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RefreshAction {
    /// Delete the pod outright
    #[default]
    Delete,
    /// Use the eviction API, honouring PodDisruptionBudgets
    Evict,
}

impl fmt::Display for RefreshAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshAction::Delete => f.write_str("Delete"),
            RefreshAction::Evict => f.write_str("Evict"),
        }
    }
}

impl FromStr for RefreshAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delete" => Ok(RefreshAction::Delete),
            "evict" => Ok(RefreshAction::Evict),
            other => Err(format!("unknown refresh action: {other}")),
        }
    }
}

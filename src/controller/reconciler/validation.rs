//! # Validation
//!
//! Validates `CertManagerDeployment` specs and resolves the effective refresh
//! settings. A spec that fails validation is reported as `Failed` and not
//! retried until its generation changes.

use crate::config::ControllerConfig;
use crate::controller::refresh::RefreshSettings;
use crate::crd::CertManagerDeployment;
use crate::selector::{Selector, SelectorError};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("certificate.secretName is required but is empty")]
    MissingSecretName,
    #[error("certificate.secretName '{0}' must be a valid Kubernetes name (lowercase alphanumeric, hyphens, dots; cannot start/end with hyphen or dot)")]
    InvalidSecretName(String),
    #[error("certificate.issuer is required but is empty")]
    MissingIssuer,
    #[error("invalid podSelector: {0}")]
    Selector(#[from] SelectorError),
    #[error("refresh.maxUnavailableFraction must be in (0, 1], got {0}")]
    InvalidFraction(f64),
    #[error("failed to compile name pattern: {0}")]
    Pattern(String),
}

/// Everything the reconciler needs from a valid spec
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSpec {
    pub secret_name: String,
    pub selector: Selector,
    pub settings: RefreshSettings,
}

/// Validate a resource and resolve its refresh settings against controller defaults
pub fn validate_deployment(
    resource: &CertManagerDeployment,
    config: &ControllerConfig,
) -> Result<ValidatedSpec, ValidationError> {
    let certificate = &resource.spec.certificate;

    let secret_name = certificate.secret_name.trim();
    if secret_name.is_empty() {
        return Err(ValidationError::MissingSecretName);
    }
    validate_kubernetes_name(secret_name)?;

    if certificate.issuer.trim().is_empty() {
        return Err(ValidationError::MissingIssuer);
    }

    let selector = Selector::parse(&resource.spec.pod_selector)?;

    let policy = resource.spec.refresh.as_ref();
    let fraction = policy
        .and_then(|p| p.max_unavailable_fraction)
        .unwrap_or(config.max_unavailable_fraction);
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(ValidationError::InvalidFraction(fraction));
    }

    Ok(ValidatedSpec {
        secret_name: secret_name.to_string(),
        selector,
        settings: RefreshSettings {
            max_unavailable_fraction: fraction,
            min_per_cycle: config.min_pods_per_cycle.max(1),
            action: policy
                .and_then(|p| p.action)
                .unwrap_or(config.refresh_action),
        },
    })
}

/// Validate a Kubernetes resource name (RFC 1123 subdomain)
fn validate_kubernetes_name(name: &str) -> Result<(), ValidationError> {
    if name.len() > 253 {
        return Err(ValidationError::InvalidSecretName(name.to_string()));
    }

    let name_regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .map_err(|e| ValidationError::Pattern(e.to_string()))?;

    if !name_regex.is_match(name) {
        return Err(ValidationError::InvalidSecretName(name.to_string()));
    }
    Ok(())
}

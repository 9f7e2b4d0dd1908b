//! # Reconciler
//!
//! Core reconciliation logic for `CertManagerDeployment` resources.
//!
//! The reconciler:
//! - Fingerprints the certificate secret referenced by the resource
//! - Compares it with the fingerprint stamped into each selected pod
//! - Deletes or evicts stale pods within the availability budget, letting
//!   their workload controller recreate them
//! - Updates resource status with the refresh outcome
//!
//! ## Reconciliation Flow
//!
//! 1. Get the resource (absent: drop tracked state)
//! 2. Validate the spec (invalid: `Failed` until the generation changes)
//! 3. Fingerprint the referenced secret (missing or malformed: `Degraded`)
//! 4. List selected pods and compare stamps
//! 5. Run the refresh executor
//! 6. Update status

pub mod reconcile;
pub mod status;
pub mod types;
pub mod validation;

// Re-export public API
pub use status::{DesiredStatus, StatusReporter};
pub use types::{
    ErrorKind, ReconcileOutcome, ReconcileResult, Reconciler, ReconcilerError, TrackedSecretState,
};
pub use validation::{validate_deployment, ValidatedSpec, ValidationError};

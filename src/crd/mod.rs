//! # Custom Resource Definitions
//!
//! CRD types for the pod refresher.
//!
//! ## Module Structure
//!
//! - `spec.rs` - `CertManagerDeployment` and its spec types
//! - `status.rs` - Status types written after each reconciliation

mod spec;
mod status;

pub use spec::{
    CertManagerDeployment, CertManagerDeploymentSpec, CertificateRef, PodSelector, RefreshAction,
    RefreshPolicy, SelectorRequirement,
};
pub use status::{CertManagerDeploymentStatus, RefreshCondition, RefreshState};

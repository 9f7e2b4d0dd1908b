//! Pod Refresher Controller Library
//!
//! Reconciler engine for `CertManagerDeployment` resources: watches the
//! certificate secret a resource references and restarts the selected pods
//! when its content changes, within an availability budget.
//!
//! ## Quick Start
//!
//! ```rust
//! use pod_refresher_controller::prelude::*;
//! ```
//!
//! This brings commonly used types into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod registry;
pub mod runtime;
pub mod selector;
pub mod server;
pub mod store;

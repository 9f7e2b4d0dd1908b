//! # Prelude
//!
//! Re-exports commonly used types for convenience.
//!
//! ## Usage
//!
//! ```rust
//! use pod_refresher_controller::prelude::*;
//! ```

// CRD types - most commonly used
pub use crate::crd::*;

// Reconciler types - core controller functionality
pub use crate::controller::reconciler::{
    ErrorKind, ReconcileOutcome, ReconcileResult, Reconciler, ReconcilerError,
};

// Queue and refresh building blocks
pub use crate::controller::fingerprint::{fingerprint_data, fingerprint_secret, Fingerprint};
pub use crate::controller::queue::WorkQueue;
pub use crate::controller::refresh::{RefreshExecutor, RefreshSettings};

// Store seam and registry
pub use crate::registry::KindRegistry;
pub use crate::selector::Selector;
pub use crate::store::{KubeStore, MemoryStore, ObjectKey, ResourceStore, StoreError};

// Config types - for configuration management
pub use crate::config::{ControllerConfig, SharedControllerConfig};

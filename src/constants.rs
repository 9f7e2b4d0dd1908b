//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// API group of the `CertManagerDeployment` resource
pub const API_GROUP: &str = "operators.opdev.io";

/// Field manager name used for status writes
pub const FIELD_MANAGER: &str = "pod-refresher-controller";

/// Annotation stamped into pods by the workload template, carrying the
/// fingerprint of the certificate secret the pod was started with
pub const DEFAULT_FINGERPRINT_ANNOTATION: &str = "operators.opdev.io/certificate-fingerprint";

/// Secret key that must be present for a certificate secret to be usable
pub const DEFAULT_REQUIRED_SECRET_KEY: &str = "tls.crt";

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default number of worker loops pulling from the reconcile queue
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: usize = 4;

/// Default fraction of a resource's pods that may be unavailable at once
pub const DEFAULT_MAX_UNAVAILABLE_FRACTION: f64 = 0.25;

/// Minimum number of pods refreshed per cycle, so single replica workloads make progress
pub const DEFAULT_MIN_PODS_PER_CYCLE: usize = 1;

/// Delay between polls while replacement pods come up (seconds)
pub const DEFAULT_REFRESH_POLL_INTERVAL_SECS: u64 = 5;

/// Default exponential backoff starting value for transient errors (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value for transient errors (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// First requeue delay while the referenced secret is missing or malformed (seconds)
pub const DEFAULT_DEGRADED_REQUEUE_SECS: u64 = 30;

/// Cap on the requeue delay while degraded (seconds)
pub const DEFAULT_DEGRADED_REQUEUE_MAX_SECS: u64 = 600;

/// Upper bound on a single reconciliation, including store I/O (seconds)
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 30;

/// Immediate re-fetch attempts after an optimistic concurrency conflict
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;

/// Default delay before restarting a watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

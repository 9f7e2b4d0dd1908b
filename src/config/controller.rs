//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use crate::constants::{
    DEFAULT_BACKOFF_MAX_MS, DEFAULT_BACKOFF_START_MS, DEFAULT_DEGRADED_REQUEUE_MAX_SECS,
    DEFAULT_DEGRADED_REQUEUE_SECS, DEFAULT_FINGERPRINT_ANNOTATION,
    DEFAULT_MAX_CONCURRENT_RECONCILIATIONS, DEFAULT_MAX_CONFLICT_RETRIES,
    DEFAULT_MAX_UNAVAILABLE_FRACTION, DEFAULT_METRICS_PORT, DEFAULT_MIN_PODS_PER_CYCLE,
    DEFAULT_RECONCILE_TIMEOUT_SECS, DEFAULT_REFRESH_POLL_INTERVAL_SECS,
    DEFAULT_REQUIRED_SECRET_KEY, DEFAULT_WATCH_RESTART_DELAY_SECS,
};
use crate::crd::RefreshAction;
use std::sync::Arc;
use std::time::Duration;

/// Configuration shared between the reconciler, the workers and the watch adapter
pub type SharedControllerConfig = Arc<ControllerConfig>;

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("text") {
            LogFormat::Text
        } else {
            LogFormat::Json
        }
    }
}

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of worker loops pulling keys from the reconcile queue
    pub max_concurrent_reconciliations: usize,
    /// Fraction of a resource's pods that may be unavailable at the same time
    /// Overridable per resource through `spec.refresh.maxUnavailableFraction`
    pub max_unavailable_fraction: f64,
    /// Pods refreshed per cycle even when the fraction rounds down to zero
    pub min_pods_per_cycle: usize,
    /// Delete pods directly or go through the eviction API
    pub refresh_action: RefreshAction,
    /// How long to wait before checking on replacement pods again (seconds)
    pub refresh_poll_interval_secs: u64,
    /// Exponential backoff starting value for transient errors (milliseconds)
    pub backoff_start_ms: u64,
    /// Exponential backoff maximum value for transient errors (milliseconds)
    pub backoff_max_ms: u64,
    /// First retry delay while the referenced secret is missing or malformed (seconds)
    pub degraded_requeue_secs: u64,
    /// Maximum retry delay while degraded (seconds)
    pub degraded_requeue_max_secs: u64,
    /// Upper bound for one reconciliation (seconds)
    pub reconcile_timeout_secs: u64,
    /// Immediate retries after a status write conflict
    pub max_conflict_retries: u32,
    /// Pod annotation carrying the stamped certificate fingerprint
    pub fingerprint_annotation: String,
    /// Secret keys that must be present and non-empty
    pub required_secret_keys: Vec<String>,
    /// Restrict watches to a single namespace (all namespaces when unset)
    pub watch_namespace: Option<String>,
    /// Watch stream restart delay after the stream ends (seconds)
    pub watch_restart_delay_secs: u64,
    /// HTTP port for metrics and probes
    pub metrics_port: u16,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: LogFormat,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            max_unavailable_fraction: DEFAULT_MAX_UNAVAILABLE_FRACTION,
            min_pods_per_cycle: DEFAULT_MIN_PODS_PER_CYCLE,
            refresh_action: RefreshAction::Delete,
            refresh_poll_interval_secs: DEFAULT_REFRESH_POLL_INTERVAL_SECS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            degraded_requeue_secs: DEFAULT_DEGRADED_REQUEUE_SECS,
            degraded_requeue_max_secs: DEFAULT_DEGRADED_REQUEUE_MAX_SECS,
            reconcile_timeout_secs: DEFAULT_RECONCILE_TIMEOUT_SECS,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            fingerprint_annotation: DEFAULT_FINGERPRINT_ANNOTATION.to_string(),
            required_secret_keys: vec![DEFAULT_REQUIRED_SECRET_KEY.to_string()],
            watch_namespace: None,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            metrics_port: DEFAULT_METRICS_PORT,
            log_level: "INFO".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_reconciliations: env_var_or_default(
                "MAX_CONCURRENT_RECONCILIATIONS",
                defaults.max_concurrent_reconciliations,
            )
            .max(1),
            max_unavailable_fraction: env_var_or_default(
                "MAX_UNAVAILABLE_FRACTION",
                defaults.max_unavailable_fraction,
            ),
            min_pods_per_cycle: env_var_or_default("MIN_PODS_PER_CYCLE", defaults.min_pods_per_cycle)
                .max(1),
            refresh_action: std::env::var("REFRESH_ACTION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.refresh_action),
            refresh_poll_interval_secs: env_var_or_default(
                "REFRESH_POLL_INTERVAL_SECS",
                defaults.refresh_poll_interval_secs,
            ),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", defaults.backoff_start_ms),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", defaults.backoff_max_ms),
            degraded_requeue_secs: env_var_or_default(
                "DEGRADED_REQUEUE_SECS",
                defaults.degraded_requeue_secs,
            ),
            degraded_requeue_max_secs: env_var_or_default(
                "DEGRADED_REQUEUE_MAX_SECS",
                defaults.degraded_requeue_max_secs,
            ),
            reconcile_timeout_secs: env_var_or_default(
                "RECONCILE_TIMEOUT_SECS",
                defaults.reconcile_timeout_secs,
            ),
            max_conflict_retries: env_var_or_default(
                "MAX_CONFLICT_RETRIES",
                defaults.max_conflict_retries,
            ),
            fingerprint_annotation: env_var_or_default_str(
                "FINGERPRINT_ANNOTATION",
                DEFAULT_FINGERPRINT_ANNOTATION,
            ),
            required_secret_keys: env_var_list("REQUIRED_SECRET_KEYS")
                .unwrap_or(defaults.required_secret_keys),
            watch_namespace: std::env::var("WATCH_NAMESPACE")
                .ok()
                .filter(|ns| !ns.trim().is_empty()),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                defaults.watch_restart_delay_secs,
            ),
            metrics_port: env_var_or_default("METRICS_PORT", defaults.metrics_port),
            log_level: env_var_or_default_str("LOG_LEVEL", "INFO"),
            log_format: LogFormat::parse(&env_var_or_default_str("LOG_FORMAT", "json")),
        }
    }

    /// Delay between polls while a refresh is in progress
    pub fn refresh_poll_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_poll_interval_secs)
    }

    /// Get backoff start duration
    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    /// Get backoff max duration
    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Upper bound for a single reconciliation
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    /// Get watch restart delay duration
    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read a comma separated environment variable, ignoring empty entries
fn env_var_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}

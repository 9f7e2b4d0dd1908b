//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `pod_refresher_reconciliations_total{result}` - Completed reconciliations by result
//! - `pod_refresher_reconciliation_errors_total{kind}` - Reconciliation errors by kind
//! - `pod_refresher_reconciliation_duration_seconds` - Duration of reconciliations
//! - `pod_refresher_pod_refresh_requests_total{action}` - Pod deletions/evictions requested
//! - `pod_refresher_blocked_evictions_total` - Evictions refused by a disruption budget
//! - `pod_refresher_status_conflicts_total` - Status writes rejected by optimistic concurrency
//! - `pod_refresher_requeues_total{reason}` - Keys requeued by reason
//! - `pod_refresher_queue_depth` - Keys waiting in the reconcile queue

use crate::crd::RefreshAction;
use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "pod_refresher_reconciliations_total",
            "Total number of completed reconciliations by result",
        ),
        &["result"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "pod_refresher_reconciliation_errors_total",
            "Total number of reconciliation errors by kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "pod_refresher_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static POD_REFRESH_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "pod_refresher_pod_refresh_requests_total",
            "Total number of pod deletions or evictions requested",
        ),
        &["action"],
    )
    .expect("Failed to create POD_REFRESH_REQUESTS_TOTAL metric - this should never happen")
});

static BLOCKED_EVICTIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pod_refresher_blocked_evictions_total",
        "Total number of evictions refused by a PodDisruptionBudget",
    )
    .expect("Failed to create BLOCKED_EVICTIONS_TOTAL metric - this should never happen")
});

static STATUS_CONFLICTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pod_refresher_status_conflicts_total",
        "Total number of status writes rejected because the resource changed",
    )
    .expect("Failed to create STATUS_CONFLICTS_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "pod_refresher_requeues_total",
            "Total number of keys requeued by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "pod_refresher_queue_depth",
        "Current number of keys waiting in the reconcile queue",
    )
    .expect("Failed to create QUEUE_DEPTH metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(POD_REFRESH_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BLOCKED_EVICTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STATUS_CONFLICTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(result: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[result]).inc();
}

pub fn increment_reconciliation_errors(kind: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_pod_refresh_requests(action: RefreshAction) {
    let label = match action {
        RefreshAction::Delete => "delete",
        RefreshAction::Evict => "evict",
    };
    POD_REFRESH_REQUESTS_TOTAL.with_label_values(&[label]).inc();
}

pub fn increment_blocked_evictions() {
    BLOCKED_EVICTIONS_TOTAL.inc();
}

pub fn increment_status_conflicts() {
    STATUS_CONFLICTS_TOTAL.inc();
}

pub fn increment_requeues(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

#[allow(clippy::cast_possible_wrap, reason = "queue depth never approaches i64::MAX")]
pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as i64);
}

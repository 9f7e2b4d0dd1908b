//! # Reconciler Integration Tests
//!
//! Drives the reconciler against a `MemoryStore`.
//!
//! These tests verify:
//! - Idempotence: a converged resource causes no deletions and no status writes
//! - Deleting a resource drops its tracked state
//! - A missing secret degrades the resource and heals once the secret exists
//! - An invalid spec fails once and is not retried until its generation changes
//! - Status write conflicts are retried against fresh state
//! - A restarted reconciler picks up where the status left off
//! - A timed out reconciliation keeps the tracked state of its resource

mod common;

use common::{
    fingerprint, reconciler, resource_key, tls_secret, DeploymentBuilder, FakeWorkload, APP,
    NAMESPACE, SECRET_NAME,
};
use pod_refresher_controller::config::ControllerConfig;
use pod_refresher_controller::controller::reconciler::{
    ErrorKind, ReconcileResult, ReconcilerError,
};
use pod_refresher_controller::crd::{CertManagerDeployment, RefreshState};
use pod_refresher_controller::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

fn status_of(store: &MemoryStore, name: &str) -> pod_refresher_controller::crd::CertManagerDeploymentStatus {
    let cmd: CertManagerDeployment = store
        .get_object(NAMESPACE, name)
        .unwrap()
        .expect("resource exists");
    cmd.status.expect("status written")
}

/// Store with a resource, its secret and three pods already on the secret
fn converged_store() -> (Arc<MemoryStore>, FakeWorkload, String) {
    let store = Arc::new(MemoryStore::new());
    let secret = tls_secret(SECRET_NAME, "certificate-a");
    let stamp = fingerprint(&secret);
    store.apply(&secret).unwrap();
    store.apply(&DeploymentBuilder::new("cluster").build()).unwrap();
    let workload = FakeWorkload::new(APP, 3);
    workload.deploy(&store, Some(&stamp));
    (store, workload, stamp)
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let (store, _workload, stamp) = converged_store();
    let reconciler = reconciler(&store, ControllerConfig::default());
    let key = resource_key("cluster");

    let first = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(first.result, ReconcileResult::RefreshComplete);
    assert_eq!(first.requeue_after, None);
    let status = status_of(&store, "cluster");
    assert_eq!(status.observed_fingerprint.as_deref(), Some(stamp.as_str()));
    assert_eq!(status.state(), Some(RefreshState::Idle));
    assert_eq!(status.stale_pods, Some(0));
    assert_eq!(status.observed_generation, Some(1));
    // Pods already ran the certificate, so nothing was refreshed
    assert_eq!(status.last_refresh_time, None);
    let writes = store.status_writes();

    let second = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(second.result, ReconcileResult::NoOp);
    assert_eq!(store.status_writes(), writes, "converged resource must not be rewritten");
    assert_eq!(status_of(&store, "cluster"), status);
    assert!(store.deleted_pods().is_empty());
}

#[tokio::test]
async fn test_deleted_resource_drops_tracked_state() {
    let (store, _workload, _) = converged_store();
    let reconciler = reconciler(&store, ControllerConfig::default());
    let key = resource_key("cluster");

    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(reconciler.tracked_count(), 1);

    assert!(store.remove::<CertManagerDeployment>(NAMESPACE, "cluster"));
    let outcome = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(outcome.result, ReconcileResult::NoOp);
    assert_eq!(reconciler.tracked_count(), 0);
    assert!(reconciler.tracked_state(&key).is_none());
}

#[tokio::test]
async fn test_missing_secret_degrades_then_heals() {
    let store = Arc::new(MemoryStore::new());
    store.apply(&DeploymentBuilder::new("cluster").build()).unwrap();
    let workload = FakeWorkload::new(APP, 2);
    workload.deploy(&store, None);
    let reconciler = reconciler(&store, ControllerConfig::default());
    let key = resource_key("cluster");

    let degraded = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(degraded.result, ReconcileResult::Degraded);
    assert_eq!(degraded.requeue_after, Some(Duration::from_secs(30)));
    let status = status_of(&store, "cluster");
    assert_eq!(status.state(), Some(RefreshState::Degraded));
    assert!(status
        .condition
        .and_then(|c| c.message)
        .is_some_and(|m| m.contains("not found")));
    assert!(store.deleted_pods().is_empty());

    // Backoff grows while the secret stays missing
    let again = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(again.requeue_after, Some(Duration::from_secs(30)));
    let third = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(third.requeue_after, Some(Duration::from_secs(60)));

    let secret = tls_secret(SECRET_NAME, "certificate-a");
    let stamp = fingerprint(&secret);
    store.apply(&secret).unwrap();

    // The unstamped pods are refreshed one at a time
    let mut deletions = 0;
    for _ in 0..10 {
        let outcome = reconciler.reconcile(&key).await.unwrap();
        if outcome.result == ReconcileResult::RefreshComplete {
            break;
        }
        assert_eq!(outcome.result, ReconcileResult::RefreshInProgress);
        deletions += workload.sync(&store, &stamp);
    }
    assert_eq!(deletions, 2);
    assert_eq!(status_of(&store, "cluster").state(), Some(RefreshState::Idle));
    let state = reconciler.tracked_state(&key).unwrap();
    assert_eq!(state.degraded_backoff.attempts(), 0);
}

#[tokio::test]
async fn test_secret_missing_required_key_degrades() {
    let store = Arc::new(MemoryStore::new());
    let mut secret = tls_secret(SECRET_NAME, "certificate-a");
    if let Some(data) = secret.data.as_mut() {
        data.remove("tls.crt");
    }
    store.apply(&secret).unwrap();
    store.apply(&DeploymentBuilder::new("cluster").build()).unwrap();
    let reconciler = reconciler(&store, ControllerConfig::default());

    let outcome = reconciler.reconcile(&resource_key("cluster")).await.unwrap();
    assert_eq!(outcome.result, ReconcileResult::Degraded);
    let message = status_of(&store, "cluster").condition.and_then(|c| c.message);
    assert!(message.is_some_and(|m| m.contains("tls.crt")));
}

#[tokio::test]
async fn test_invalid_spec_fails_until_generation_changes() {
    let (store, _workload, _) = converged_store();
    store
        .apply(&DeploymentBuilder::new("cluster").no_selector().build())
        .unwrap();
    let reconciler = reconciler(&store, ControllerConfig::default());
    let key = resource_key("cluster");

    let failed = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(failed.result, ReconcileResult::Failed);
    assert_eq!(failed.requeue_after, None);
    let status = status_of(&store, "cluster");
    assert_eq!(status.state(), Some(RefreshState::Failed));
    let writes = store.status_writes();

    let skipped = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(skipped.result, ReconcileResult::NoOp);
    assert_eq!(store.status_writes(), writes);

    store.apply(&DeploymentBuilder::new("cluster").build()).unwrap();
    let fixed = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(fixed.result, ReconcileResult::RefreshComplete);
    assert_eq!(status_of(&store, "cluster").state(), Some(RefreshState::Idle));
    assert!(store.deleted_pods().is_empty());
}

#[tokio::test]
async fn test_status_conflicts_are_retried() {
    let (store, _workload, stamp) = converged_store();
    let reconciler = reconciler(&store, ControllerConfig::default());
    store.inject_conflicts(2);

    let outcome = reconciler.reconcile(&resource_key("cluster")).await.unwrap();
    assert_eq!(outcome.result, ReconcileResult::RefreshComplete);
    assert_eq!(store.status_writes(), 1);
    assert_eq!(
        status_of(&store, "cluster").observed_fingerprint.as_deref(),
        Some(stamp.as_str())
    );
}

#[tokio::test]
async fn test_conflict_retries_exhausted_is_transient() {
    let (store, _workload, _) = converged_store();
    let config = ControllerConfig {
        max_conflict_retries: 1,
        ..ControllerConfig::default()
    };
    let reconciler = reconciler(&store, config);
    store.inject_conflicts(5);

    let err = reconciler
        .reconcile(&resource_key("cluster"))
        .await
        .unwrap_err();
    match &err {
        ReconcilerError::ConflictRetriesExhausted { attempts, .. } => assert_eq!(*attempts, 2),
        other => panic!("expected ConflictRetriesExhausted, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(store.status_writes(), 0);
}

#[tokio::test]
async fn test_restarted_reconciler_resumes_from_status() {
    let (store, _workload, stamp) = converged_store();
    let key = resource_key("cluster");
    reconciler(&store, ControllerConfig::default())
        .reconcile(&key)
        .await
        .unwrap();
    let writes = store.status_writes();

    let restarted = reconciler(&store, ControllerConfig::default());
    let outcome = restarted.reconcile(&key).await.unwrap();
    assert_eq!(outcome.result, ReconcileResult::NoOp);
    assert_eq!(store.status_writes(), writes);
    assert!(store.deleted_pods().is_empty());

    let state = restarted.tracked_state(&key).unwrap();
    assert_eq!(state.last_applied.as_deref(), Some(stamp.as_str()));
    assert_eq!(state.state, RefreshState::Idle);
}

#[tokio::test]
async fn test_secret_reference_change_refreshes_pods() {
    let (store, workload, _) = converged_store();
    let reconciler = reconciler(&store, ControllerConfig::default());
    let key = resource_key("cluster");
    reconciler.reconcile(&key).await.unwrap();

    let other = tls_secret("other-tls", "certificate-b");
    let other_stamp = fingerprint(&other);
    store.apply(&other).unwrap();
    store
        .apply(&DeploymentBuilder::new("cluster").secret("other-tls").build())
        .unwrap();

    let outcome = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(outcome.result, ReconcileResult::RefreshInProgress);
    assert_eq!(store.deleted_pods().len(), 1);
    let state = reconciler.tracked_state(&key).unwrap();
    assert_eq!(state.secret.name, "other-tls");
    assert_eq!(state.fingerprint.digest(), Some(other_stamp.as_str()));
    assert_eq!(workload.sync(&store, &other_stamp), 1);
}

#[tokio::test]
async fn test_degraded_backoff_advances_once_per_reconciliation() {
    let store = Arc::new(MemoryStore::new());
    store.apply(&DeploymentBuilder::new("cluster").build()).unwrap();
    let reconciler = reconciler(&store, ControllerConfig::default());
    let key = resource_key("cluster");
    store.inject_conflicts(2);

    let degraded = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(degraded.result, ReconcileResult::Degraded);
    assert_eq!(degraded.requeue_after, Some(Duration::from_secs(30)));
    assert_eq!(store.status_writes(), 1);
    let state = reconciler.tracked_state(&key).unwrap();
    assert_eq!(state.degraded_backoff.attempts(), 1);

    let again = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(again.requeue_after, Some(Duration::from_secs(30)));
    let third = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(third.requeue_after, Some(Duration::from_secs(60)));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_keeps_tracked_state() {
    let store = Arc::new(MemoryStore::new());
    store.set_graceful_deletion(true);
    let secret_a = tls_secret(SECRET_NAME, "certificate-a");
    let stamp_a = fingerprint(&secret_a);
    store.apply(&secret_a).unwrap();
    store
        .apply(&DeploymentBuilder::new("cluster").fraction(0.5).build())
        .unwrap();
    FakeWorkload::new(APP, 4).deploy(&store, Some(&stamp_a));

    let config = ControllerConfig {
        reconcile_timeout_secs: 5,
        ..ControllerConfig::default()
    };
    let reconciler = reconciler(&store, config);
    let key = resource_key("cluster");
    reconciler.reconcile_with_timeout(&key).await.unwrap();

    store.apply(&tls_secret(SECRET_NAME, "certificate-b")).unwrap();
    let progress = reconciler.reconcile_with_timeout(&key).await.unwrap();
    assert_eq!(progress.result, ReconcileResult::RefreshInProgress);
    assert_eq!(store.deleted_pods().len(), 2);

    store.stall_next_lists(1);
    let err = reconciler.reconcile_with_timeout(&key).await.unwrap_err();
    assert!(matches!(err, ReconcilerError::Timeout(d) if d == Duration::from_secs(5)));
    assert_eq!(err.kind(), ErrorKind::Transient);

    let state = reconciler
        .tracked_state(&key)
        .expect("tracked state survives the timeout");
    assert_eq!(state.last_applied.as_deref(), Some(stamp_a.as_str()));
    assert_eq!(state.requested.len(), 2);
    assert_eq!(state.state, RefreshState::Refreshing);

    // The pods already requested are still terminating and are not requested again
    let resumed = reconciler.reconcile_with_timeout(&key).await.unwrap();
    assert_eq!(resumed.result, ReconcileResult::RefreshInProgress);
    assert_eq!(store.deleted_pods().len(), 2);
}

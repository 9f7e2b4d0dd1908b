//! # Certificate Rotation Scenario Tests
//!
//! End-to-end rotations against a `MemoryStore`, with a `FakeWorkload`
//! recreating the pods the reconciler deletes.

mod common;

use common::{
    fingerprint, reconciler, resource_key, tls_secret, DeploymentBuilder, FakeWorkload, APP,
    NAMESPACE, SECRET_NAME,
};
use pod_refresher_controller::config::ControllerConfig;
use pod_refresher_controller::controller::reconciler::{ReconcileResult, Reconciler};
use pod_refresher_controller::crd::{CertManagerDeployment, RefreshState};
use pod_refresher_controller::store::{MemoryStore, ObjectKey};
use std::collections::HashSet;
use std::sync::Arc;

/// Reconcile and let the workload catch up until the resource settles
///
/// Returns the results seen, in order.
async fn run_until_settled(
    reconciler: &Reconciler,
    store: &MemoryStore,
    workload: &FakeWorkload,
    key: &ObjectKey,
    stamp: &str,
) -> Vec<ReconcileResult> {
    let mut results = Vec::new();
    for _ in 0..20 {
        let outcome = reconciler.reconcile(key).await.unwrap();
        results.push(outcome.result);
        if outcome.requeue_after.is_none() {
            return results;
        }
        workload.sync(store, stamp);
    }
    panic!("resource did not settle: {results:?}");
}

fn state_of(store: &MemoryStore, name: &str) -> Option<RefreshState> {
    let cmd: CertManagerDeployment = store.get_object(NAMESPACE, name).unwrap()?;
    cmd.status?.state()
}

#[tokio::test]
async fn test_tls_secret_rotation_refreshes_each_pod_once() {
    let store = Arc::new(MemoryStore::new());
    let secret_a = tls_secret(SECRET_NAME, "certificate-a");
    let stamp_a = fingerprint(&secret_a);
    store.apply(&secret_a).unwrap();
    store.apply(&DeploymentBuilder::new("cluster").build()).unwrap();
    let workload = FakeWorkload::new(APP, 3);
    workload.deploy(&store, Some(&stamp_a));

    let reconciler = reconciler(&store, ControllerConfig::default());
    let key = resource_key("cluster");
    let results = run_until_settled(&reconciler, &store, &workload, &key, &stamp_a).await;
    assert_eq!(results, vec![ReconcileResult::RefreshComplete]);
    assert!(store.deleted_pods().is_empty());

    // Rotate A -> B
    let secret_b = tls_secret(SECRET_NAME, "certificate-b");
    let stamp_b = fingerprint(&secret_b);
    assert_ne!(stamp_a, stamp_b);
    store.apply(&secret_b).unwrap();

    let first = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(first.result, ReconcileResult::RefreshInProgress);
    assert_eq!(state_of(&store, "cluster"), Some(RefreshState::Refreshing));
    workload.sync(&store, &stamp_b);

    let results = run_until_settled(&reconciler, &store, &workload, &key, &stamp_b).await;
    assert_eq!(results.last(), Some(&ReconcileResult::RefreshComplete));
    assert_eq!(state_of(&store, "cluster"), Some(RefreshState::Idle));

    let deleted = store.deleted_pods();
    assert_eq!(deleted.len(), 3, "each pod is refreshed exactly once: {deleted:?}");
    let distinct: HashSet<&ObjectKey> = deleted.iter().collect();
    assert_eq!(distinct.len(), 3);
    assert!(workload
        .stamps(&store)
        .values()
        .all(|s| s.as_deref() == Some(stamp_b.as_str())));

    let cmd: CertManagerDeployment = store.get_object(NAMESPACE, "cluster").unwrap().unwrap();
    let status = cmd.status.unwrap();
    assert_eq!(status.observed_fingerprint.as_deref(), Some(stamp_b.as_str()));
    assert!(status.last_refresh_time.is_some());

    // Settled: nothing more happens
    let writes = store.status_writes();
    let outcome = reconciler.reconcile(&key).await.unwrap();
    assert_eq!(outcome.result, ReconcileResult::NoOp);
    assert_eq!(store.deleted_pods().len(), 3);
    assert_eq!(store.status_writes(), writes);
}

#[tokio::test]
async fn test_budget_limits_concurrent_deletions() {
    let store = Arc::new(MemoryStore::new());
    let secret_a = tls_secret(SECRET_NAME, "certificate-a");
    store.apply(&secret_a).unwrap();
    store
        .apply(&DeploymentBuilder::new("cluster").fraction(0.5).build())
        .unwrap();
    let workload = FakeWorkload::new(APP, 4);
    workload.deploy(&store, Some(&fingerprint(&secret_a)));
    store.set_graceful_deletion(true);

    let reconciler = reconciler(&store, ControllerConfig::default());
    let key = resource_key("cluster");
    reconciler.reconcile(&key).await.unwrap();

    let secret_b = tls_secret(SECRET_NAME, "certificate-b");
    store.apply(&secret_b).unwrap();

    // Terminating pods count against the budget until they are gone
    for _ in 0..3 {
        let outcome = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(outcome.result, ReconcileResult::RefreshInProgress);
        assert_eq!(store.deleted_pods().len(), 2);
    }

    assert_eq!(store.finalize_terminating(), 2);
    workload.sync(&store, &fingerprint(&secret_b));
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(store.deleted_pods().len(), 4);
}

#[tokio::test]
async fn test_unready_replacements_hold_back_the_rollout() {
    let store = Arc::new(MemoryStore::new());
    let secret_a = tls_secret(SECRET_NAME, "certificate-a");
    store.apply(&secret_a).unwrap();
    store.apply(&DeploymentBuilder::new("cluster").build()).unwrap();
    let mut workload = FakeWorkload::new(APP, 2);
    workload.ready_on_create = false;
    workload.deploy(&store, Some(&fingerprint(&secret_a)));

    let reconciler = reconciler(&store, ControllerConfig::default());
    let key = resource_key("cluster");
    reconciler.reconcile(&key).await.unwrap();

    let secret_b = tls_secret(SECRET_NAME, "certificate-b");
    let stamp_b = fingerprint(&secret_b);
    store.apply(&secret_b).unwrap();

    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(store.deleted_pods().len(), 1);
    workload.sync(&store, &stamp_b);

    // The replacement is not ready yet, so the second pod waits
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(store.deleted_pods().len(), 1);

    workload.mark_ready(&store);
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(store.deleted_pods().len(), 2);
}

#[tokio::test]
async fn test_resources_are_isolated() {
    let store = Arc::new(MemoryStore::new());
    let shared = tls_secret(SECRET_NAME, "certificate-a");
    let other = tls_secret("other-tls", "certificate-x");
    store.apply(&shared).unwrap();
    store.apply(&other).unwrap();
    store.apply(&DeploymentBuilder::new("webhook").build()).unwrap();
    store
        .apply(&DeploymentBuilder::new("api").secret("other-tls").app("api").build())
        .unwrap();
    let webhook = FakeWorkload::new(APP, 2);
    let api = FakeWorkload::new("api", 2);
    webhook.deploy(&store, Some(&fingerprint(&shared)));
    api.deploy(&store, Some(&fingerprint(&other)));

    let reconciler = reconciler(&store, ControllerConfig::default());
    for name in ["webhook", "api"] {
        reconciler.reconcile(&resource_key(name)).await.unwrap();
    }

    let rotated = tls_secret(SECRET_NAME, "certificate-b");
    store.apply(&rotated).unwrap();
    for name in ["webhook", "api"] {
        reconciler.reconcile(&resource_key(name)).await.unwrap();
    }

    let deleted = store.deleted_pods();
    assert_eq!(deleted.len(), 1);
    assert!(deleted[0].name.starts_with("webhook-"));
    assert_eq!(state_of(&store, "api"), Some(RefreshState::Idle));
}

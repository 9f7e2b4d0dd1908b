//! Common test utilities for reconciler integration tests
//!
//! Per-test builders for resources, secrets and pods, plus a `FakeWorkload`
//! standing in for the workload controller that recreates deleted pods.
//! Every test gets a fresh `MemoryStore`.

#![allow(dead_code, reason = "each test binary uses a different subset of the helpers")]

use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use pod_refresher_controller::config::ControllerConfig;
use pod_refresher_controller::constants::DEFAULT_FINGERPRINT_ANNOTATION;
use pod_refresher_controller::controller::fingerprint::fingerprint_secret;
use pod_refresher_controller::controller::reconciler::Reconciler;
use pod_refresher_controller::crd::{
    CertManagerDeployment, CertManagerDeploymentSpec, CertificateRef, PodSelector, RefreshAction,
    RefreshPolicy,
};
use pod_refresher_controller::registry::KindRegistry;
use pod_refresher_controller::store::{MemoryStore, ObjectKey, ResourceStore};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NAMESPACE: &str = "cert-manager";
pub const SECRET_NAME: &str = "tls-secret";
pub const APP: &str = "webhook";

/// Builder for `CertManagerDeployment` fixtures
#[derive(Debug, Clone)]
pub struct DeploymentBuilder {
    name: String,
    secret_name: String,
    labels: BTreeMap<String, String>,
    refresh: Option<RefreshPolicy>,
}

impl DeploymentBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            secret_name: SECRET_NAME.to_string(),
            labels: BTreeMap::from([("app".to_string(), APP.to_string())]),
            refresh: None,
        }
    }

    pub fn secret(mut self, secret_name: &str) -> Self {
        self.secret_name = secret_name.to_string();
        self
    }

    pub fn app(mut self, app: &str) -> Self {
        self.labels = BTreeMap::from([("app".to_string(), app.to_string())]);
        self
    }

    /// Clear the selector, which makes the spec invalid
    pub fn no_selector(mut self) -> Self {
        self.labels.clear();
        self
    }

    pub fn fraction(mut self, fraction: f64) -> Self {
        self.refresh.get_or_insert_with(RefreshPolicy::default).max_unavailable_fraction =
            Some(fraction);
        self
    }

    pub fn action(mut self, action: RefreshAction) -> Self {
        self.refresh.get_or_insert_with(RefreshPolicy::default).action = Some(action);
        self
    }

    pub fn build(self) -> CertManagerDeployment {
        let mut cmd = CertManagerDeployment::new(
            &self.name,
            CertManagerDeploymentSpec {
                version: Some("v1.3.1".to_string()),
                certificate: CertificateRef {
                    issuer: "selfsigned-issuer".to_string(),
                    secret_name: self.secret_name,
                },
                pod_selector: PodSelector {
                    match_labels: (!self.labels.is_empty()).then_some(self.labels),
                    match_expressions: None,
                },
                refresh: self.refresh,
            },
        );
        cmd.metadata.namespace = Some(NAMESPACE.to_string());
        cmd
    }
}

/// Certificate secret whose `tls.crt` holds `certificate`
pub fn tls_secret(name: &str, certificate: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            ("tls.crt".to_string(), ByteString(certificate.as_bytes().to_vec())),
            ("tls.key".to_string(), ByteString(b"private-key".to_vec())),
        ])),
        type_: Some("kubernetes.io/tls".to_string()),
        ..Default::default()
    }
}

/// Fingerprint the reconciler computes for a secret
pub fn fingerprint(secret: &Secret) -> String {
    fingerprint_secret(Some(secret))
        .digest()
        .map(str::to_string)
        .unwrap_or_default()
}

/// Pod selected by `app`, stamped with `stamp` when given
pub fn pod(name: &str, app: &str, stamp: Option<&str>, ready: bool) -> Pod {
    let annotations = stamp.map(|s| {
        BTreeMap::from([(DEFAULT_FINGERPRINT_ANNOTATION.to_string(), s.to_string())])
    });
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
            annotations,
            ..Default::default()
        },
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Reconciler over a memory store with the default registry
pub fn reconciler(store: &Arc<MemoryStore>, config: ControllerConfig) -> Reconciler {
    let store: Arc<dyn ResourceStore> = Arc::clone(store) as Arc<dyn ResourceStore>;
    Reconciler::new(store, Arc::new(KindRegistry::with_defaults()), Arc::new(config))
        .expect("default registry resolves every kind")
}

pub fn resource_key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

/// Stand-in for a Deployment or StatefulSet controller
///
/// Keeps a fixed set of pod names alive: any name missing from the store is
/// recreated (with a new UID) stamped with the certificate fingerprint the
/// pod template currently carries.
#[derive(Debug, Clone)]
pub struct FakeWorkload {
    pub app: String,
    pub names: Vec<String>,
    /// Whether recreated pods come up ready immediately
    pub ready_on_create: bool,
}

impl FakeWorkload {
    pub fn new(app: &str, replicas: usize) -> Self {
        Self {
            app: app.to_string(),
            names: (0..replicas).map(|i| format!("{app}-{i}")).collect(),
            ready_on_create: true,
        }
    }

    /// Create every pod, stamped with `stamp`
    pub fn deploy(&self, store: &MemoryStore, stamp: Option<&str>) {
        for name in &self.names {
            store
                .apply(&pod(name, &self.app, stamp, true))
                .expect("apply pod");
        }
    }

    /// Recreate missing pods stamped with `stamp`, returning how many were created
    pub fn sync(&self, store: &MemoryStore, stamp: &str) -> usize {
        let mut created = 0;
        for name in &self.names {
            let existing: Option<Pod> = store.get_object(NAMESPACE, name).expect("read pod");
            if existing.is_none() {
                store
                    .apply(&pod(name, &self.app, Some(stamp), self.ready_on_create))
                    .expect("apply pod");
                created += 1;
            }
        }
        created
    }

    /// Mark every pod ready
    pub fn mark_ready(&self, store: &MemoryStore) {
        for name in &self.names {
            let existing: Option<Pod> = store.get_object(NAMESPACE, name).expect("read pod");
            if let Some(mut pod) = existing {
                if let Some(conditions) = pod.status.as_mut().and_then(|s| s.conditions.as_mut()) {
                    for condition in conditions {
                        condition.status = "True".to_string();
                    }
                }
                store.apply(&pod).expect("apply pod");
            }
        }
    }

    /// Fingerprints stamped on the current pods, by name
    pub fn stamps(&self, store: &MemoryStore) -> BTreeMap<String, Option<String>> {
        store
            .list_objects::<Pod>(NAMESPACE)
            .expect("list pods")
            .into_iter()
            .filter(|p| {
                p.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get("app"))
                    .is_some_and(|app| *app == self.app)
            })
            .map(|p| {
                let stamp = p
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(DEFAULT_FINGERPRINT_ANNOTATION))
                    .cloned();
                (p.metadata.name.unwrap_or_default(), stamp)
            })
            .collect()
    }
}

//! # Kubernetes Store
//!
//! [`ResourceStore`] backed by the Kubernetes API server.

use crate::constants::FIELD_MANAGER;
use crate::selector::Selector;
use crate::store::{ResourceStore, StoreError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use tracing::debug;

/// Store talking to the API server through a `kube::Client`
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, kind)
    }
}

/// Map a client error onto the store taxonomy
fn classify(err: kube::Error, what: &str) -> StoreError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => StoreError::NotFound(what.to_string()),
            409 => StoreError::Conflict(what.to_string()),
            408 | 429 | 500 | 502 | 503 | 504 => {
                StoreError::Transient(format!("{what}: {}", response.message))
            }
            _ => StoreError::Fatal(format!("{what}: {}", response.message)),
        },
        other => StoreError::Transient(format!("{what}: {other}")),
    }
}

fn describe(kind: &ApiResource, namespace: &str, name: &str) -> String {
    format!("{} {namespace}/{name}", kind.kind)
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        self.api(kind, namespace)
            .get_opt(name)
            .await
            .map_err(|e| classify(e, &describe(kind, namespace, name)))
    }

    async fn list(
        &self,
        kind: &ApiResource,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let params = ListParams::default().labels(&selector.to_selector_string());
        let list = self
            .api(kind, namespace)
            .list(&params)
            .await
            .map_err(|e| classify(e, &format!("{} in {namespace}", kind.plural)))?;
        Ok(list.items)
    }

    async fn update_status(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
        expected_version: &str,
        status: serde_json::Value,
    ) -> Result<String, StoreError> {
        // A merge patch carrying resourceVersion makes the API server reject
        // the write with 409 when the object moved on.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": expected_version },
            "status": status,
        });
        let updated = self
            .api(kind, namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, &describe(kind, namespace, name)))?;
        Ok(updated.metadata.resource_version.unwrap_or_default())
    }

    async fn delete(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.api(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify(e, &describe(kind, namespace, name)))?;
        debug!(kind = %kind.kind, namespace, name, "delete accepted");
        Ok(())
    }

    async fn evict(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let what = format!("Pod {namespace}/{name}");
        match pods.evict(name, &EvictParams::default()).await {
            Ok(_) => Ok(()),
            // 429 from the eviction subresource means a PodDisruptionBudget said no
            Err(kube::Error::Api(response)) if response.code == 429 => {
                Err(StoreError::Blocked(what))
            }
            Err(e) => Err(classify(e, &what)),
        }
    }
}

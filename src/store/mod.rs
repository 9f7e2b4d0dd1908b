//! # Resource Store
//!
//! The seam between the reconciler and wherever resources actually live.
//!
//! - `kube_api`: backed by the Kubernetes API server
//! - `memory`: in-process store with versioning and failure injection, used by tests
//!
//! Objects cross the seam as `DynamicObject`s addressed by the `ApiResource`
//! resolved from the [`KindRegistry`](crate::registry::KindRegistry). The
//! typed helpers at the bottom of this module convert to and from concrete
//! resource types.

pub mod kube_api;
pub mod memory;

use crate::registry::KindRegistry;
use crate::selector::Selector;
use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub use self::kube_api::KubeStore;
pub use self::memory::MemoryStore;

/// Errors surfaced by a [`ResourceStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic concurrency rejection: the expected version is stale
    #[error("conflict writing {0}: the object was modified")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    /// Eviction refused because of a PodDisruptionBudget
    #[error("eviction of {0} blocked by a disruption budget")]
    Blocked(String),
    /// Timeouts, throttling, connection failures; worth retrying
    #[error("transient store failure: {0}")]
    Transient(String),
    /// Rejected requests that will not succeed on retry
    #[error("store rejected request: {0}")]
    Fatal(String),
    #[error("failed to decode object: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("kind {0} is not registered")]
    UnregisteredKind(String),
}

impl StoreError {
    /// Whether retrying the same request later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Transient(_))
    }
}

/// Namespace and name of a namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced resource, `None` for cluster scoped objects
    pub fn from_resource<K: Resource>(obj: &K) -> Option<Self> {
        Some(Self::new(obj.namespace()?, obj.name_any()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read and compare-and-write access to stored resources
///
/// Writes never overwrite silently: a stale `expected_version` surfaces as
/// [`StoreError::Conflict`].
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError>;

    /// List objects of a kind in a namespace matching a label selector
    async fn list(
        &self,
        kind: &ApiResource,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    /// Replace the status subresource if the object is still at `expected_version`
    ///
    /// Returns the new resource version.
    async fn update_status(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
        expected_version: &str,
        status: serde_json::Value,
    ) -> Result<String, StoreError>;

    /// Delete an object
    async fn delete(&self, kind: &ApiResource, namespace: &str, name: &str)
        -> Result<(), StoreError>;

    /// Evict a pod through the eviction subresource
    async fn evict(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// Convert a dynamic object into a concrete resource type
pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> Result<K, StoreError> {
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}

/// Convert a concrete resource into a dynamic object carrying its type metadata
pub fn to_dynamic<K>(obj: &K) -> Result<DynamicObject, StoreError>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".into(), K::api_version(&()).into_owned().into());
        map.insert("kind".into(), K::kind(&()).into_owned().into());
    }
    Ok(serde_json::from_value(value)?)
}

/// Fetch a typed object through the registry
pub async fn get_typed<K>(
    store: &dyn ResourceStore,
    registry: &KindRegistry,
    key: &ObjectKey,
) -> Result<Option<K>, StoreError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let kind = registry.resolve::<K>()?;
    store
        .get(kind, &key.namespace, &key.name)
        .await?
        .map(from_dynamic)
        .transpose()
}

/// List typed objects through the registry
pub async fn list_typed<K>(
    store: &dyn ResourceStore,
    registry: &KindRegistry,
    namespace: &str,
    selector: &Selector,
) -> Result<Vec<K>, StoreError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let kind = registry.resolve::<K>()?;
    store
        .list(kind, namespace, selector)
        .await?
        .into_iter()
        .map(from_dynamic)
        .collect()
}

//! # Kind Registry
//!
//! Explicit registry of the resource kinds the controller reads and writes.
//!
//! The registry is built once at process start and handed by reference to the
//! store and the reconciler. A kind that was never registered cannot be read
//! or written, which surfaces wiring mistakes as a `StoreError::UnregisteredKind`
//! instead of a silent lookup against shared global state.

use crate::crd::CertManagerDeployment;
use crate::store::StoreError;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::core::{ApiResource, Resource};
use std::collections::BTreeMap;

/// Registered kinds, keyed by `apiVersion/Kind`
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<String, ApiResource>,
}

impl KindRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every kind the pod refresher needs:
    /// `CertManagerDeployment`, `Secret` and `Pod`
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new()
            .register::<CertManagerDeployment>()
            .register::<Secret>()
            .register::<Pod>()
    }

    /// Register a statically typed kind
    #[must_use]
    pub fn register<K>(mut self) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        let resource = ApiResource::erase::<K>(&());
        self.kinds
            .insert(registry_key(&resource.api_version, &resource.kind), resource);
        self
    }

    /// Look up the API resource for a statically typed kind
    pub fn resolve<K>(&self) -> Result<&ApiResource, StoreError>
    where
        K: Resource<DynamicType = ()>,
    {
        let api_version = K::api_version(&());
        let kind = K::kind(&());
        self.get(&api_version, &kind)
            .ok_or_else(|| StoreError::UnregisteredKind(registry_key(&api_version, &kind)))
    }

    /// Look up a kind by `apiVersion` and `kind`
    #[must_use]
    pub fn get(&self, api_version: &str, kind: &str) -> Option<&ApiResource> {
        self.kinds.get(&registry_key(api_version, kind))
    }

    /// Iterate over the registered kinds
    pub fn kinds(&self) -> impl Iterator<Item = &ApiResource> {
        self.kinds.values()
    }
}

fn registry_key(api_version: &str, kind: &str) -> String {
    format!("{api_version}/{kind}")
}

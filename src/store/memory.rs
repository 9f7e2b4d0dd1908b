//! # In-Memory Store
//!
//! A versioned, in-process [`ResourceStore`] standing in for the API server.
//!
//! Every write bumps a store-wide resource version, so compare-and-write
//! behaves like it does against a real API server. Failures can be injected
//! (status write conflicts, transient delete errors, eviction refusals,
//! hanging lists) and
//! pod deletions are recorded so tests can count refreshes.

use crate::selector::Selector;
use crate::store::{from_dynamic, to_dynamic, ObjectKey, ResourceStore, StoreError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::core::{ApiResource, DynamicObject, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

type StoreKey = (String, String, String);

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<StoreKey, DynamicObject>,
    version: u64,
    uid: u64,
    pod_deletions: Vec<ObjectKey>,
    status_writes: usize,
    injected_conflicts: u32,
    failing_deletes: u32,
    stalled_lists: u32,
    blocked_evictions: HashSet<ObjectKey>,
    graceful_deletion: bool,
}

impl MemoryState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uid += 1;
        format!("uid-{:06}", self.uid)
    }
}

/// In-memory resource store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

fn type_key(api_version: &str, kind: &str) -> String {
    format!("{api_version}/{kind}")
}

fn store_key(kind: &ApiResource, namespace: &str, name: &str) -> StoreKey {
    (
        type_key(&kind.api_version, &kind.kind),
        namespace.to_string(),
        name.to_string(),
    )
}

fn typed_key<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> StoreKey {
    (
        type_key(&K::api_version(&()), &K::kind(&())),
        namespace.to_string(),
        name.to_string(),
    )
}

fn is_pod(key: &StoreKey) -> bool {
    key.0 == type_key(&Pod::api_version(&()), &Pod::kind(&()))
}

fn deletion_timestamp() -> Result<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time, StoreError> {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    Ok(serde_json::from_value(serde_json::Value::String(now))?)
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace an object, the way `kubectl apply` would
    ///
    /// The store manages `uid`, `resourceVersion` and `generation`: the
    /// generation starts at 1 and is bumped whenever `spec` changes. When
    /// the incoming object carries no status, the stored status is kept.
    pub fn apply<K>(&self, obj: &K) -> Result<ObjectKey, StoreError>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let mut incoming = to_dynamic(obj)?;
        let namespace = incoming.metadata.namespace.clone().unwrap_or_default();
        let name = incoming.metadata.name.clone().unwrap_or_default();
        if name.is_empty() {
            return Err(StoreError::Fatal("object has no name".to_string()));
        }
        let key = typed_key::<K>(&namespace, &name);

        let mut state = self.state();
        let existing = state.objects.get(&key).cloned();
        match existing {
            Some(existing) => {
                let spec_changed = existing.data.get("spec") != incoming.data.get("spec");
                let generation = existing.metadata.generation.unwrap_or(1);
                incoming.metadata.generation =
                    Some(if spec_changed { generation + 1 } else { generation });
                incoming.metadata.uid = existing.metadata.uid.clone();
                if incoming.metadata.deletion_timestamp.is_none() {
                    incoming.metadata.deletion_timestamp =
                        existing.metadata.deletion_timestamp.clone();
                }
                let has_status = incoming.data.get("status").is_some_and(|s| !s.is_null());
                if !has_status {
                    if let (Some(status), Some(map)) =
                        (existing.data.get("status"), incoming.data.as_object_mut())
                    {
                        map.insert("status".to_string(), status.clone());
                    }
                }
            }
            None => {
                incoming.metadata.generation = Some(1);
                incoming.metadata.uid = Some(state.next_uid());
            }
        }
        incoming.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key, incoming);
        Ok(ObjectKey::new(namespace, name))
    }

    /// Remove an object without recording a deletion, as if someone else deleted it
    pub fn remove<K>(&self, namespace: &str, name: &str) -> bool
    where
        K: Resource<DynamicType = ()>,
    {
        self.state()
            .objects
            .remove(&typed_key::<K>(namespace, name))
            .is_some()
    }

    /// Typed read, bypassing the registry
    pub fn get_object<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let obj = self
            .state()
            .objects
            .get(&typed_key::<K>(namespace, name))
            .cloned();
        obj.map(from_dynamic).transpose()
    }

    /// Every object of a kind in a namespace, ordered by name
    pub fn list_objects<K>(&self, namespace: &str) -> Result<Vec<K>, StoreError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let kind = type_key(&K::api_version(&()), &K::kind(&()));
        let objects: Vec<DynamicObject> = self
            .state()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, obj)| obj.clone())
            .collect();
        objects.into_iter().map(from_dynamic).collect()
    }

    /// Pods deleted or evicted through the store, in request order
    pub fn deleted_pods(&self) -> Vec<ObjectKey> {
        self.state().pod_deletions.clone()
    }

    /// Number of accepted status writes
    pub fn status_writes(&self) -> usize {
        self.state().status_writes
    }

    /// Make the next `count` status writes fail with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.state().injected_conflicts = count;
    }

    /// Make the next `count` deletes fail with a transient error
    pub fn fail_next_deletes(&self, count: u32) {
        self.state().failing_deletes = count;
    }

    /// Make the next `count` lists hang forever, like an unresponsive API server
    pub fn stall_next_lists(&self, count: u32) {
        self.state().stalled_lists = count;
    }

    /// Refuse evictions of a pod as a disruption budget would
    pub fn block_eviction(&self, namespace: &str, name: &str) {
        self.state()
            .blocked_evictions
            .insert(ObjectKey::new(namespace, name));
    }

    /// Keep deleted pods around as terminating until [`Self::finalize_terminating`]
    pub fn set_graceful_deletion(&self, graceful: bool) {
        self.state().graceful_deletion = graceful;
    }

    /// Remove every terminating object, returning how many were removed
    pub fn finalize_terminating(&self) -> usize {
        let mut state = self.state();
        let before = state.objects.len();
        state
            .objects
            .retain(|_, obj| obj.metadata.deletion_timestamp.is_none());
        before - state.objects.len()
    }

    fn delete_locked(state: &mut MemoryState, key: StoreKey) -> Result<(), StoreError> {
        let describe = || format!("{} {}/{}", key.0, key.1, key.2);
        let Some(existing) = state.objects.get(&key) else {
            return Err(StoreError::NotFound(describe()));
        };
        if existing.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        if is_pod(&key) {
            state
                .pod_deletions
                .push(ObjectKey::new(key.1.clone(), key.2.clone()));
        }

        if is_pod(&key) && state.graceful_deletion {
            let timestamp = deletion_timestamp()?;
            let version = state.next_version();
            if let Some(obj) = state.objects.get_mut(&key) {
                obj.metadata.deletion_timestamp = Some(timestamp);
                obj.metadata.resource_version = Some(version);
            }
        } else {
            state.objects.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        Ok(self
            .state()
            .objects
            .get(&store_key(kind, namespace, name))
            .cloned())
    }

    async fn list(
        &self,
        kind: &ApiResource,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let stalled = {
            let mut state = self.state();
            let stalled = state.stalled_lists > 0;
            state.stalled_lists = state.stalled_lists.saturating_sub(1);
            stalled
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let kind = type_key(&kind.api_version, &kind.kind);
        Ok(self
            .state()
            .objects
            .iter()
            .filter(|((k, ns, _), obj)| {
                *k == kind && ns == namespace && selector.matches_opt(obj.metadata.labels.as_ref())
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn update_status(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
        expected_version: &str,
        status: serde_json::Value,
    ) -> Result<String, StoreError> {
        let key = store_key(kind, namespace, name);
        let describe = format!("{} {namespace}/{name}", kind.kind);
        let mut state = self.state();

        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            return Err(StoreError::Conflict(describe));
        }

        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(describe.clone()))?
            .metadata
            .resource_version
            .clone();
        if current.as_deref() != Some(expected_version) {
            return Err(StoreError::Conflict(describe));
        }

        let version = state.next_version();
        if let Some(obj) = state.objects.get_mut(&key) {
            if let Some(map) = obj.data.as_object_mut() {
                map.insert("status".to_string(), status);
            } else {
                obj.data = serde_json::json!({ "status": status });
            }
            obj.metadata.resource_version = Some(version.clone());
        }
        state.status_writes += 1;
        Ok(version)
    }

    async fn delete(
        &self,
        kind: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(StoreError::Transient(format!(
                "injected failure deleting {} {namespace}/{name}",
                kind.kind
            )));
        }
        Self::delete_locked(&mut state, store_key(kind, namespace, name))
    }

    async fn evict(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        if state
            .blocked_evictions
            .contains(&ObjectKey::new(namespace, name))
        {
            return Err(StoreError::Blocked(format!("Pod {namespace}/{name}")));
        }
        Self::delete_locked(&mut state, typed_key::<Pod>(namespace, name))
    }
}

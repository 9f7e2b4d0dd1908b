//! # Watch Adapter
//!
//! Turns cluster changes into reconcile queue keys.
//!
//! Three watch streams feed one queue:
//!
//! - `CertManagerDeployment`: each change enqueues the resource itself and
//!   updates the [`ResourceIndex`]
//! - `Secret`: a change enqueues every resource referencing the secret
//! - `Pod`: a change enqueues every resource whose selector matches the pod
//!
//! Events carry no payload into the reconciler; it always reads fresh state
//! from the store. Each stream is restarted after a delay when it ends.

use crate::config::ControllerConfig;
use crate::controller::queue::WorkQueue;
use crate::crd::CertManagerDeployment;
use crate::runtime::error_policy::handle_watch_stream_error;
use crate::selector::Selector;
use crate::store::ObjectKey;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::Api;
use kube::{Client, Resource, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// What the adapter remembers about a resource to route secret and pod events
#[derive(Debug, Clone)]
struct IndexEntry {
    secret_name: String,
    /// `None` when the selector is invalid; such a resource matches no pods
    selector: Option<Selector>,
}

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<ObjectKey, IndexEntry>,
    /// Keys seen during an initial listing, `None` outside of one
    resync: Option<HashSet<ObjectKey>>,
}

/// Index of watched resources by secret reference and pod selector
#[derive(Debug, Default)]
pub struct ResourceIndex {
    state: Mutex<IndexState>,
}

impl ResourceIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record or refresh a resource, returning its key
    pub fn upsert(&self, resource: &CertManagerDeployment) -> Option<ObjectKey> {
        let key = ObjectKey::from_resource(resource)?;
        let entry = IndexEntry {
            secret_name: resource.spec.certificate.secret_name.trim().to_string(),
            selector: Selector::parse(&resource.spec.pod_selector).ok(),
        };
        let mut state = self.state();
        if let Some(seen) = state.resync.as_mut() {
            seen.insert(key.clone());
        }
        state.entries.insert(key.clone(), entry);
        Some(key)
    }

    /// Forget a resource
    pub fn remove(&self, key: &ObjectKey) -> bool {
        self.state().entries.remove(key).is_some()
    }

    /// Start an initial listing; entries not seen before [`Self::finish_resync`] are dropped
    pub fn begin_resync(&self) {
        self.state().resync = Some(HashSet::new());
    }

    /// End an initial listing, returning the keys that disappeared meanwhile
    pub fn finish_resync(&self) -> Vec<ObjectKey> {
        let mut state = self.state();
        let Some(seen) = state.resync.take() else {
            return Vec::new();
        };
        let gone: Vec<ObjectKey> = state
            .entries
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        for key in &gone {
            state.entries.remove(key);
        }
        gone
    }

    /// Resources in `namespace` referencing the secret `name`
    #[must_use]
    pub fn resources_for_secret(&self, namespace: &str, name: &str) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self
            .state()
            .entries
            .iter()
            .filter(|(key, entry)| key.namespace == namespace && entry.secret_name == name)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Resources in `namespace` whose selector matches `labels`
    #[must_use]
    pub fn resources_for_pod(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self
            .state()
            .entries
            .iter()
            .filter(|(key, entry)| {
                key.namespace == namespace
                    && entry.selector.as_ref().is_some_and(|s| s.matches(labels))
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Route a `CertManagerDeployment` event
pub fn handle_resource_event(
    index: &ResourceIndex,
    queue: &WorkQueue<ObjectKey>,
    event: watcher::Event<CertManagerDeployment>,
) {
    match event {
        watcher::Event::Init => index.begin_resync(),
        watcher::Event::Apply(resource) | watcher::Event::InitApply(resource) => {
            if let Some(key) = index.upsert(&resource) {
                debug!(resource = %key, "CertManagerDeployment changed");
                queue.add(key);
            }
        }
        watcher::Event::Delete(resource) => {
            if let Some(key) = ObjectKey::from_resource(&resource) {
                index.remove(&key);
                debug!(resource = %key, "CertManagerDeployment deleted");
                queue.add(key);
            }
        }
        watcher::Event::InitDone => {
            for key in index.finish_resync() {
                debug!(resource = %key, "CertManagerDeployment gone during resync");
                queue.add(key);
            }
        }
    }
}

/// Route a `Secret` event to the resources referencing the secret
pub fn handle_secret_event(
    index: &ResourceIndex,
    queue: &WorkQueue<ObjectKey>,
    event: watcher::Event<Secret>,
) {
    let secret = match event {
        watcher::Event::Apply(secret)
        | watcher::Event::InitApply(secret)
        | watcher::Event::Delete(secret) => secret,
        watcher::Event::Init | watcher::Event::InitDone => return,
    };
    let Some(namespace) = secret.namespace() else {
        return;
    };
    for key in index.resources_for_secret(&namespace, &secret.name_any()) {
        debug!(resource = %key, secret = %secret.name_any(), "Referenced secret changed");
        queue.add(key);
    }
}

/// Route a `Pod` event to the resources selecting the pod
pub fn handle_pod_event(index: &ResourceIndex, queue: &WorkQueue<ObjectKey>, event: watcher::Event<Pod>) {
    let pod = match event {
        watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) | watcher::Event::Delete(pod) => {
            pod
        }
        watcher::Event::Init | watcher::Event::InitDone => return,
    };
    let Some(namespace) = pod.namespace() else {
        return;
    };
    for key in index.resources_for_pod(&namespace, pod.labels()) {
        queue.add(key);
    }
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Run one watch stream forever, restarting it when it ends
async fn watch_kind<K, F>(api: Api<K>, watch: &'static str, config: &ControllerConfig, mut on_event: F)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    F: FnMut(watcher::Event<K>),
{
    let backoff = AtomicU64::new(config.backoff_start_ms);
    loop {
        let watch_span = tracing::span!(tracing::Level::INFO, "controller.watch", watch = watch);
        info!(parent: &watch_span, "Starting {watch} watch");

        let mut stream = watcher(api.clone(), watcher::Config::default())
            .default_backoff()
            .boxed();
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    backoff.store(config.backoff_start_ms, Ordering::Relaxed);
                    on_event(event);
                }
                Err(e) => {
                    let keep_going = handle_watch_stream_error(
                        watch,
                        &format!("{e:?}"),
                        &backoff,
                        config.backoff_max_ms,
                        config.watch_restart_delay_duration(),
                    )
                    .await;
                    if !keep_going {
                        break;
                    }
                }
            }
        }

        warn!(
            "{watch} watch stream ended, restarting in {} seconds...",
            config.watch_restart_delay_secs
        );
        tokio::time::sleep(config.watch_restart_delay_duration()).await;
    }
}

/// Run the resource, secret and pod watches until the future is dropped
pub async fn run_watchers(
    client: Client,
    queue: WorkQueue<ObjectKey>,
    index: Arc<ResourceIndex>,
    config: Arc<ControllerConfig>,
) {
    let namespace = config.watch_namespace.as_deref();
    match namespace {
        Some(ns) => info!("Watching namespace {ns}"),
        None => info!("Watching all namespaces"),
    }

    let resources = watch_kind(
        scoped_api::<CertManagerDeployment>(&client, namespace),
        "certmanagerdeployments",
        &config,
        |event| handle_resource_event(&index, &queue, event),
    );
    let secrets = watch_kind(
        scoped_api::<Secret>(&client, namespace),
        "secrets",
        &config,
        |event| handle_secret_event(&index, &queue, event),
    );
    let pods = watch_kind(
        scoped_api::<Pod>(&client, namespace),
        "pods",
        &config,
        |event| handle_pod_event(&index, &queue, event),
    );

    tokio::join!(resources, secrets, pods);
}

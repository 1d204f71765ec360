//! Kubernetes resource watchers.
//!
//! One strongly-typed watcher per resource kind mirrors live cluster state
//! into a local `Cache` and invokes a change callback for every effective
//! change. Updates whose `resourceVersion` matches the cached object are
//! suppressed, so no-op writes never reach the work queues.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::TryStreamExt;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::watcher;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::ControllerError;

/// Cache/queue key for a namespaced object.
pub fn cache_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Cache/queue key of a live object.
pub fn object_key<K: Resource>(obj: &K) -> String {
    cache_key(&obj.namespace().unwrap_or_default(), &obj.name_any())
}

/// Splits a queue key back into `(namespace, name)`. Returns `None` for
/// malformed keys, which the dispatch loop drops without retrying.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    match key.split_once('/') {
        Some((namespace, name))
            if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Some((namespace, name))
        }
        _ => None,
    }
}

/// Read-through mirror of one resource kind, keyed by `namespace/name`.
///
/// Lookups of deleted keys return `None`; callers treat that as a soft
/// condition, not an error. Safe for concurrent reads from all workers.
pub struct Cache<K> {
    objects: Arc<RwLock<HashMap<String, Arc<K>>>>,
    synced: Arc<AtomicBool>,
    synced_notify: Arc<Notify>,
}

impl<K> Clone for Cache<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
            synced: Arc::clone(&self.synced),
            synced_notify: Arc::clone(&self.synced_notify),
        }
    }
}

impl<K> std::fmt::Debug for Cache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("synced", &self.synced()).finish()
    }
}

impl<K> Default for Cache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Cache<K> {
    /// Creates an empty, not-yet-synchronized cache.
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            synced: Arc::new(AtomicBool::new(false)),
            synced_notify: Arc::new(Notify::new()),
        }
    }

    /// Whether the initial listing has completed.
    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Waits until the initial listing has completed.
    pub async fn wait_synced(&self) {
        loop {
            let notified = self.synced_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.synced() {
                return;
            }
            notified.await;
        }
    }

    fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
        self.synced_notify.notify_waiters();
    }
}

impl<K: Resource> Cache<K> {
    /// Point lookup. `None` means the object does not (or no longer) exist.
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache_key(namespace, name))
            .cloned()
    }

    /// Snapshot of all cached objects.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl<K: Resource + Clone> Cache<K> {
    /// Upserts an object, returning whether it differs from the cached copy
    /// (new key, or a different `resourceVersion`).
    pub(crate) fn apply(&self, obj: &K) -> bool {
        let key = object_key(obj);
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let changed = match objects.get(&key) {
            Some(previous) => previous.resource_version() != obj.resource_version(),
            None => true,
        };
        objects.insert(key, Arc::new(obj.clone()));
        changed
    }

    /// Removes an object by key.
    pub(crate) fn remove(&self, key: &str) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Drops every key not in `keep`, returning the removed objects. Used
    /// after a re-list to evict objects deleted while the watch was down.
    pub(crate) fn retain_keys(&self, keep: &HashSet<String>) -> Vec<Arc<K>> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let gone: Vec<String> =
            objects.keys().filter(|k| !keep.contains(*k)).cloned().collect();
        gone.iter().filter_map(|k| objects.remove(k)).collect()
    }
}

/// Watches one resource kind, keeping its `Cache` current and invoking
/// `on_change` for every effective add, update, or delete.
pub struct ResourceWatcher<K> {
    api: Api<K>,
    cache: Cache<K>,
    kind: &'static str,
}

impl<K> ResourceWatcher<K>
where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a watcher for `kind` backed by `api`, mirroring into `cache`.
    pub fn new(api: Api<K>, cache: Cache<K>, kind: &'static str) -> Self {
        Self { api, cache, kind }
    }

    /// Runs the watch loop until the stream fails.
    pub async fn run<F>(self, on_change: F) -> Result<(), ControllerError>
    where
        F: Fn(&K) + Send + Sync,
    {
        info!("Starting {} watcher", self.kind);

        let mut stream = Box::pin(watcher(self.api.clone(), watcher::Config::default()));
        let mut relisted: HashSet<String> = HashSet::new();

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("{} watcher stream error: {}", self.kind, e)))?
        {
            match event {
                watcher::Event::Init => {
                    relisted.clear();
                    debug!("{} cache (re)list started", self.kind);
                }
                watcher::Event::InitApply(obj) => {
                    relisted.insert(object_key(&obj));
                    if self.cache.apply(&obj) {
                        on_change(&obj);
                    }
                }
                watcher::Event::InitDone => {
                    for gone in self.cache.retain_keys(&relisted) {
                        on_change(&gone);
                    }
                    self.cache.mark_synced();
                    info!("{} cache synchronized", self.kind);
                }
                watcher::Event::Apply(obj) => {
                    if self.cache.apply(&obj) {
                        on_change(&obj);
                    } else {
                        debug!("{} {} unchanged, skipping", self.kind, object_key(&obj));
                    }
                }
                watcher::Event::Delete(obj) => {
                    self.cache.remove(&object_key(&obj));
                    on_change(&obj);
                }
            }
        }

        Ok(())
    }
}

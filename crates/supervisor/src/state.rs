//! A local store of node resources.
//!
//! Producers outside of this crate (network configuration, time sync, node
//! identity) put resources here; readiness conditions watch them. Every write
//! is broadcast as an [`Event`] so that readers are notified instead of polling.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::trace;

const EVENT_CAPACITY: usize = 128;

/// Identifies a resource by kind and ID.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resource kind, e.g. `TimeStatuses.time`.
    pub kind: String,
    /// Resource ID within its kind.
    pub id: String,
}

impl ResourceKey {
    /// Creates a key.
    pub fn new<K: Into<String>, I: Into<String>>(kind: K, id: I) -> Self {
        ResourceKey {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// A stored resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource identity.
    pub key: ResourceKey,
    /// Bumped on every write. Starts at 1.
    pub version: u64,
    /// Resource body.
    pub spec: Value,
}

/// A change notification.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A resource was created or updated.
    Put(Resource),
    /// A resource was deleted.
    Deleted(ResourceKey),
}

impl Event {
    /// The key of the resource the event is about.
    pub fn key(&self) -> &ResourceKey {
        match self {
            Event::Put(resource) => &resource.key,
            Event::Deleted(key) => key,
        }
    }
}

/// Shared resource store.
///
/// Cloning is cheap; all clones share the same contents.
#[derive(Clone)]
pub struct ResourceStore {
    inner: Arc<Inner>,
}

struct Inner {
    objects: RwLock<HashMap<ResourceKey, Resource>>,
    events: broadcast::Sender<Event>,
}

impl Default for ResourceStore {
    fn default() -> Self {
        ResourceStore::new()
    }
}

impl fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceStore").finish()
    }
}

impl ResourceStore {
    /// Initialize empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        ResourceStore {
            inner: Arc::new(Inner {
                objects: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Creates or replaces a resource and returns the stored copy.
    pub async fn put(&self, key: ResourceKey, spec: Value) -> Resource {
        let mut objects = self.inner.objects.write().await;
        let version = objects.get(&key).map(|r| r.version + 1).unwrap_or(1);
        let resource = Resource { key, version, spec };
        objects.insert(resource.key.clone(), resource.clone());
        trace!(key = %resource.key, version, "Resource updated");
        // Sending while holding the lock keeps event order identical to write order.
        let _ = self.inner.events.send(Event::Put(resource.clone()));
        resource
    }

    /// Deletes a resource. Returns the removed resource, if it existed.
    pub async fn delete(&self, key: &ResourceKey) -> Option<Resource> {
        let mut objects = self.inner.objects.write().await;
        let removed = objects.remove(key);
        if removed.is_some() {
            trace!(%key, "Resource deleted");
            let _ = self.inner.events.send(Event::Deleted(key.clone()));
        }
        removed
    }

    /// Fetches a resource.
    pub async fn get(&self, key: &ResourceKey) -> Option<Resource> {
        self.inner.objects.read().await.get(key).cloned()
    }

    /// Lists all resources of a kind, sorted by ID.
    pub async fn list(&self, kind: &str) -> Vec<Resource> {
        let objects = self.inner.objects.read().await;
        let mut resources: Vec<Resource> = objects
            .values()
            .filter(|r| r.key.kind == kind)
            .cloned()
            .collect();
        resources.sort_by(|a, b| a.key.id.cmp(&b.key.id));
        resources
    }

    /// Returns the current value of `key` together with a receiver that sees
    /// every change made after that value was read.
    pub async fn watch(&self, key: &ResourceKey) -> (Option<Resource>, broadcast::Receiver<Event>) {
        let objects = self.inner.objects.read().await;
        let receiver = self.inner.events.subscribe();
        (objects.get(key).cloned(), receiver)
    }
}

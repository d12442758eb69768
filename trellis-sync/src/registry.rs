//! Table of named, lazily created containers for one window.
//!
//! The registry is an explicit object owned by the window's
//! [`SyncContext`](crate::context::SyncContext) and shared by reference.
//!
//! Contract:
//! - `create_or_get` on an id that is already registered returns the
//!   existing handle unchanged. The new initializer never runs and the new
//!   options are ignored.
//! - Concurrent `create_or_get` calls for one id share a single creation.
//! - `destroy` waits for an in-flight creation of the same id, removes the
//!   entry before the transport teardown starts, then tears down. A
//!   `create_or_get` issued during teardown builds a fresh container.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::Mutex;

use crate::codec::{container_id, STORE_SUFFIX};
use crate::config::SyncOptions;
use crate::container::{Handle, Lifecycle, SyncValue, SyncedContainer};
use crate::error::{SyncError, SyncResult};
use crate::transport::{Transport, WindowId};

/// A registered container: the typed handle plus its lifecycle.
#[derive(Clone)]
struct RegistryEntry {
    handle: Arc<dyn Any + Send + Sync>,
    lifecycle: Arc<dyn Lifecycle>,
}

impl RegistryEntry {
    fn new<T: SyncValue>(container: Handle<T>) -> Self {
        Self {
            handle: container.clone().into_any(),
            lifecycle: container,
        }
    }

    fn downcast<T: SyncValue>(&self) -> Option<Handle<T>> {
        self.handle.clone().downcast::<SyncedContainer<T>>().ok()
    }
}

pub struct StoreRegistry {
    transport: Arc<dyn Transport>,
    entries: DashMap<String, RegistryEntry>,
    /// Per-id gate serializing creation and destruction.
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl StoreRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            entries: DashMap::new(),
            gates: DashMap::new(),
        }
    }

    pub fn window_id(&self) -> WindowId {
        self.transport.window_id()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Return the container registered as `<id>-store`, creating it with
    /// `init` and `options` if there is none.
    pub async fn create_or_get<T, F>(&self, id: &str, init: F, options: SyncOptions) -> SyncResult<Handle<T>>
    where
        T: SyncValue,
        F: FnOnce() -> Option<T>,
    {
        let key = container_id(id);
        if let Some(existing) = self.lookup::<T>(&key) {
            debug!("{key} already registered, initializer discarded");
            return existing;
        }

        let gate = self.gate(&key);
        let guard = gate.lock().await;

        // Another caller may have finished creating while we waited.
        if let Some(existing) = self.lookup::<T>(&key) {
            debug!("{key} created concurrently, initializer discarded");
            drop(guard);
            self.release_gate(&key, gate);
            return existing;
        }

        let container = SyncedContainer::open(key.clone(), init(), options, self.transport.as_ref()).await;
        self.entries.insert(key.clone(), RegistryEntry::new(container.clone()));
        info!("{key} created");

        drop(guard);
        self.release_gate(&key, gate);
        Ok(container)
    }

    /// The container registered for `id`, if it holds a `T`.
    pub fn get<T: SyncValue>(&self, id: &str) -> Option<Handle<T>> {
        self.lookup::<T>(&container_id(id)).and_then(Result::ok)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(&container_id(id))
    }

    /// Destroy the container registered for `id`. Unknown ids are a no-op.
    pub async fn destroy(&self, id: &str) {
        let key = container_id(id);
        let gate = self.gate(&key);
        let guard = gate.lock().await;

        // Deregistration is visible before teardown starts.
        let removed = self.entries.remove(&key);
        drop(guard);
        self.release_gate(&key, gate);

        match removed {
            Some((_, entry)) => {
                entry.lifecycle.teardown().await;
                info!("{key} destroyed");
            }
            None => debug!("{key} not registered, nothing to destroy"),
        }
    }

    /// Destroy every registered container.
    pub async fn destroy_all(&self) {
        for key in self.list_ids() {
            if let Some(id) = key.strip_suffix(STORE_SUFFIX) {
                self.destroy(id).await;
            }
        }
    }

    /// Start the container registered for `id`. Returns `false` if unknown.
    pub fn start(&self, id: &str) -> bool {
        self.with_lifecycle(id, |l| l.start())
    }

    /// Stop the container registered for `id`. Returns `false` if unknown.
    pub fn stop(&self, id: &str) -> bool {
        self.with_lifecycle(id, |l| l.stop())
    }

    /// Whether the container for caller id `id` exists and is started.
    pub fn is_running(&self, id: &str) -> bool {
        self.entries
            .get(&container_id(id))
            .map(|e| e.lifecycle.is_running())
            .unwrap_or(false)
    }

    /// Registered container ids (`<id>-store`), sorted.
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup<T: SyncValue>(&self, key: &str) -> Option<SyncResult<Handle<T>>> {
        let entry = self.entries.get(key)?.value().clone();
        Some(entry.downcast::<T>().ok_or_else(|| SyncError::TypeMismatch { id: key.to_string() }))
    }

    fn with_lifecycle(&self, id: &str, f: impl FnOnce(&dyn Lifecycle)) -> bool {
        let lifecycle = match self.entries.get(&container_id(id)) {
            Some(entry) => entry.lifecycle.clone(),
            None => return false,
        };
        f(lifecycle.as_ref());
        true
    }

    fn gate(&self, key: &str) -> Arc<Mutex<()>> {
        self.gates.entry(key.to_string()).or_default().value().clone()
    }

    /// Drop the gate once nobody else holds it.
    fn release_gate(&self, key: &str, gate: Arc<Mutex<()>>) {
        drop(gate);
        self.gates.remove_if(key, |_, g| Arc::strong_count(g) == 1);
    }
}

//! Bidirectional adapter between a window's query cache and a container.
//!
//! One bridge exists per (window, query key). It keeps `last_synced`, the
//! reference most recently moved in either direction, and a count of local
//! pushes still waiting for their tick ("in flight").
//!
//! **Local → remote.** Sync enabled, local value `V` present and not
//! `Arc::ptr_eq` to `last_synced`: record `V` as `last_synced`, bump the
//! push generation, and on the next scheduler tick write `V` into the
//! container. The tick writes only if `V` is still the latest scheduled
//! value and sync is still enabled at that moment, so two local updates
//! before a tick land in call order with the older one dropped.
//!
//! **Remote → local.** Sync enabled, no push in flight, container value `R`
//! present and not `ptr_eq` to `last_synced`: record `R` and write it into
//! the cache.
//!
//! A value that has round-tripped is `ptr_eq` to `last_synced`, so neither
//! rule fires for it again. Equality is by reference only: callers must
//! produce a new `Arc` for every logical change. Turning sync off and on
//! does not reset `last_synced`, so a reference seen before is still
//! considered synced afterwards.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::cache::QueryCache;
use crate::codec::QueryKey;
use crate::container::{Handle, SyncValue};

/// Per-bridge state shared with the deferred ticks and the watcher task.
struct BridgeState<T> {
    /// Also serializes scheduling a push against a tick writing one.
    last_synced: Mutex<Option<Arc<T>>>,
    /// Generation of the most recently scheduled local push.
    generation: AtomicU64,
    /// Scheduled pushes whose tick has not run yet.
    pending: AtomicUsize,
    enabled: AtomicBool,
    pushed: AtomicU64,
    pulled: AtomicU64,
}

impl<T> BridgeState<T> {
    fn last_synced(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        match self.last_synced.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Everything the two rules touch.
struct BridgeCore<T> {
    key: QueryKey,
    container: Handle<T>,
    cache: QueryCache,
    state: BridgeState<T>,
}

impl<T: SyncValue> BridgeCore<T> {
    fn push_local(self: &Arc<Self>, local: Arc<T>) {
        let generation = {
            let mut last = self.state.last_synced();
            if last.as_ref().is_some_and(|l| Arc::ptr_eq(l, &local)) {
                return;
            }
            *last = Some(local.clone());
            self.state.pending.fetch_add(1, Ordering::AcqRel);
            self.state.generation.fetch_add(1, Ordering::AcqRel) + 1
        };

        let core = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            core.run_tick(generation, local);
            core.state.pending.fetch_sub(1, Ordering::AcqRel);
            core.pull_remote();
        });
    }

    fn run_tick(&self, generation: u64, local: Arc<T>) {
        let _last = self.state.last_synced();
        if self.state.generation.load(Ordering::Acquire) != generation {
            trace!("{}: local value superseded before its tick", self.container.id());
        } else if !self.state.enabled.load(Ordering::Acquire) {
            // Read the flag now, not when the tick was scheduled.
            debug!("{}: sync disabled before tick, push skipped", self.container.id());
        } else {
            self.container.set_shared(local);
            self.state.pushed.fetch_add(1, Ordering::Relaxed);
            trace!("{}: local value pushed", self.container.id());
        }
    }

    fn pull_remote(&self) {
        if !self.state.enabled.load(Ordering::Acquire) {
            return;
        }
        let Some(remote) = self.container.get() else {
            return;
        };
        {
            let mut last = self.state.last_synced();
            if self.state.pending.load(Ordering::Acquire) > 0 {
                return;
            }
            if last.as_ref().is_some_and(|l| Arc::ptr_eq(l, &remote)) {
                return;
            }
            *last = Some(remote.clone());
        }
        self.state.pulled.fetch_add(1, Ordering::Relaxed);
        trace!("{}: remote value pulled into cache", self.container.id());
        self.cache.set_shared(&self.key, remote);
    }
}

/// Bridge between one query key in the cache and its container.
pub struct SyncBridge<T: SyncValue> {
    core: Arc<BridgeCore<T>>,
    watcher: JoinHandle<()>,
}

impl<T: SyncValue> SyncBridge<T> {
    /// Attach to `container` and start watching it for remote changes.
    /// Sync starts disabled until the first [`sync`](Self::sync) call.
    pub fn new(key: QueryKey, container: Handle<T>, cache: QueryCache) -> Self {
        let core = Arc::new(BridgeCore {
            key,
            container,
            cache,
            state: BridgeState {
                last_synced: Mutex::new(None),
                generation: AtomicU64::new(0),
                pending: AtomicUsize::new(0),
                enabled: AtomicBool::new(false),
                pushed: AtomicU64::new(0),
                pulled: AtomicU64::new(0),
            },
        });

        let mut changes = core.container.subscribe();
        let watched = core.clone();
        let watcher = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                changes.borrow_and_update();
                watched.pull_remote();
            }
        });

        Self { core, watcher }
    }

    /// Re-evaluate both rules. Call on every local update cycle.
    pub fn sync(&self, enabled: bool, local: Option<Arc<T>>) {
        self.core.state.enabled.store(enabled, Ordering::Release);
        if !enabled {
            return;
        }
        if let Some(local) = local {
            self.core.push_local(local);
        }
        self.core.pull_remote();
    }

    /// Query key this bridge serves.
    pub fn key(&self) -> &[Value] {
        &self.core.key
    }

    /// Container on the other side of the bridge.
    pub fn container(&self) -> &Handle<T> {
        &self.core.container
    }

    /// Flag passed to the latest [`sync`](Self::sync) call.
    pub fn is_enabled(&self) -> bool {
        self.core.state.enabled.load(Ordering::Acquire)
    }

    /// Whether a local push is waiting for its tick.
    pub fn is_in_flight(&self) -> bool {
        self.core.state.pending.load(Ordering::Acquire) > 0
    }

    /// Reference most recently moved in either direction.
    pub fn last_synced(&self) -> Option<Arc<T>> {
        self.core.state.last_synced().clone()
    }

    /// Local values written into the container.
    pub fn pushed(&self) -> u64 {
        self.core.state.pushed.load(Ordering::Relaxed)
    }

    /// Remote values written into the cache.
    pub fn pulled(&self) -> u64 {
        self.core.state.pulled.load(Ordering::Relaxed)
    }
}

impl<T: SyncValue> Drop for SyncBridge<T> {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

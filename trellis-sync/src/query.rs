//! Query fetch hook with cross-window sync.
//!
//! A [`SyncedQuery`] owns one query key in a window: it fetches the initial
//! value (unless some window already has one), optionally follows a live host
//! event, and wires a [`SyncBridge`] between the window's cache and the
//! shared container for the key.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::bridge::SyncBridge;
use crate::cache::{CacheEvent, QueryCache};
use crate::codec::QueryKey;
use crate::config::SyncOptions;
use crate::container::{Handle, SyncValue};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};

/// Payload rewrite applied to live events before they are decoded.
pub type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

type CustomFetch<T> = Arc<dyn Fn() -> BoxFuture<'static, SyncResult<T>> + Send + Sync>;

/// Where the value of a query comes from.
pub enum Fetcher<T> {
    /// A host command; its JSON result is decoded into `T`.
    Command { name: String, args: Value },
    Custom(CustomFetch<T>),
}

impl<T> Fetcher<T> {
    pub fn command(name: impl Into<String>, args: Value) -> Self {
        Fetcher::Command { name: name.into(), args }
    }

    pub fn custom<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
    {
        let boxed: CustomFetch<T> = Arc::new(move || -> BoxFuture<'static, SyncResult<T>> { Box::pin(f()) });
        Fetcher::Custom(boxed)
    }
}

impl<T> Clone for Fetcher<T> {
    fn clone(&self) -> Self {
        match self {
            Fetcher::Command { name, args } => Fetcher::Command { name: name.clone(), args: args.clone() },
            Fetcher::Custom(f) => Fetcher::Custom(f.clone()),
        }
    }
}

struct LiveEvent {
    event: String,
    transform: Option<Transform>,
}

/// How to mount a [`SyncedQuery`].
pub struct QueryOptions<T> {
    key: QueryKey,
    fetcher: Option<Fetcher<T>>,
    live: Option<LiveEvent>,
    sync_enabled: bool,
    fetch_on_mount: bool,
    sync: Option<SyncOptions>,
}

impl<T> QueryOptions<T> {
    pub fn new(key: QueryKey) -> Self {
        Self {
            key,
            fetcher: None,
            live: None,
            sync_enabled: true,
            fetch_on_mount: true,
            sync: None,
        }
    }

    pub fn fetcher(mut self, fetcher: Fetcher<T>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Fetch through the host command `name`.
    pub fn command(self, name: impl Into<String>, args: Value) -> Self {
        self.fetcher(Fetcher::command(name, args))
    }

    /// Overwrite the cached value with each payload of host event `event`.
    pub fn live_event(mut self, event: impl Into<String>) -> Self {
        self.live = Some(LiveEvent { event: event.into(), transform: None });
        self
    }

    pub fn live_event_with<F>(mut self, event: impl Into<String>, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.live = Some(LiveEvent {
            event: event.into(),
            transform: Some(Arc::new(transform)),
        });
        self
    }

    pub fn sync_enabled(mut self, enabled: bool) -> Self {
        self.sync_enabled = enabled;
        self
    }

    pub fn fetch_on_mount(mut self, fetch: bool) -> Self {
        self.fetch_on_mount = fetch;
        self
    }

    /// Container options; the context's `query_sync` is used otherwise.
    pub fn sync_options(mut self, options: SyncOptions) -> Self {
        self.sync = Some(options);
        self
    }
}

/// A mounted query. Unmounts on drop.
pub struct SyncedQuery<T: SyncValue> {
    ctx: Arc<SyncContext>,
    key: QueryKey,
    caller_id: String,
    fetcher: Option<Fetcher<T>>,
    bridge: Arc<SyncBridge<T>>,
    enabled: Arc<AtomicBool>,
    last_error: Mutex<Option<SyncError>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: SyncValue> SyncedQuery<T> {
    pub async fn mount(ctx: Arc<SyncContext>, options: QueryOptions<T>) -> SyncResult<Self> {
        let QueryOptions {
            key,
            fetcher,
            live,
            sync_enabled,
            fetch_on_mount,
            sync,
        } = options;

        let caller_id = ctx.codec().caller_id(&key);
        let sync = sync.unwrap_or_else(|| ctx.config().query_sync.clone());
        let container = ctx.registry().create_or_get::<T, _>(&caller_id, || None, sync).await?;

        let cache = ctx.cache().clone();
        let bridge = Arc::new(SyncBridge::new(key.clone(), container, cache.clone()));
        let enabled = Arc::new(AtomicBool::new(sync_enabled));

        let mut tasks = vec![spawn_driver(caller_id.clone(), key.clone(), cache.clone(), bridge.clone(), enabled.clone())];
        if let Some(live) = live {
            tasks.push(spawn_live::<T>(&ctx, live, key.clone(), cache.clone(), &caller_id));
        }

        let query = Self {
            ctx,
            key,
            caller_id,
            fetcher,
            bridge,
            enabled,
            last_error: Mutex::new(None),
            tasks,
        };

        // First render: picks up a value another window already produced.
        query.bridge.sync(sync_enabled, cache.get::<T>(&query.key));

        if !fetch_on_mount || query.fetcher.is_none() {
            return Ok(query);
        }
        if query.has_value() {
            debug!("{}: value present, initial fetch skipped", query.caller_id);
        } else {
            // Failures are kept in `last_error`; the query still mounts.
            let _ = query.refetch().await;
        }
        Ok(query)
    }

    /// Query key this instance was mounted with.
    pub fn key(&self) -> &[Value] {
        &self.key
    }

    /// Cache id of the query key.
    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    /// Current cache value for the key, shared with every reader.
    pub fn data(&self) -> Option<Arc<T>> {
        self.ctx.cache().get::<T>(&self.key)
    }

    /// Container backing the key in this window.
    pub fn container(&self) -> &Handle<T> {
        self.bridge.container()
    }

    pub fn bridge(&self) -> &SyncBridge<T> {
        &self.bridge
    }

    /// Error of the latest fetch, cleared by the next successful one.
    pub fn last_error(&self) -> Option<SyncError> {
        self.error_slot().clone()
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Run the fetcher and store the result in the cache.
    pub async fn refetch(&self) -> SyncResult<Arc<T>> {
        match self.fetch().await {
            Ok(value) => {
                *self.error_slot() = None;
                Ok(self.store(value))
            }
            Err(e) => {
                warn!("{}: fetch failed: {e}", self.caller_id);
                *self.error_slot() = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Write a value locally, as a fetch result would.
    pub fn set_data(&self, value: T) -> Arc<T> {
        self.store(value)
    }

    /// Toggle propagation. Re-enabling pushes the current cache value.
    pub fn set_sync_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        self.bridge.sync(enabled, self.data());
    }

    /// Stop the driver and live-event tasks. The container stays registered.
    pub fn unmount(self) {
        drop(self);
    }

    fn store(&self, value: T) -> Arc<T> {
        let value = self.ctx.cache().set(&self.key, value);
        self.bridge.sync(self.is_sync_enabled(), Some(value.clone()));
        value
    }

    fn has_value(&self) -> bool {
        self.ctx.cache().contains(&self.key) || self.bridge.container().get().is_some()
    }

    async fn fetch(&self) -> SyncResult<T> {
        match &self.fetcher {
            Some(Fetcher::Command { name, args }) => {
                let value = self.ctx.commands().invoke(name, args.clone()).await?;
                Ok(serde_json::from_value(value)?)
            }
            Some(Fetcher::Custom(f)) => f().await,
            None => Err(SyncError::Fetch(format!("{}: no fetcher configured", self.caller_id))),
        }
    }

    fn error_slot(&self) -> MutexGuard<'_, Option<SyncError>> {
        match self.last_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: SyncValue> Drop for SyncedQuery<T> {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        debug!("{}: unmounted", self.caller_id);
    }
}

/// Re-run the bridge on every cache change for the key.
fn spawn_driver<T: SyncValue>(
    caller_id: String,
    key: QueryKey,
    cache: QueryCache,
    bridge: Arc<SyncBridge<T>>,
    enabled: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let mut changes = cache.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(CacheEvent::Updated { id }) if id == caller_id => {
                    bridge.sync(enabled.load(Ordering::Acquire), cache.get::<T>(&key));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    debug!("{caller_id}: cache driver lagged by {n}");
                    bridge.sync(enabled.load(Ordering::Acquire), cache.get::<T>(&key));
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_live<T: SyncValue>(
    ctx: &SyncContext,
    live: LiveEvent,
    key: QueryKey,
    cache: QueryCache,
    caller_id: &str,
) -> JoinHandle<()> {
    let mut events = ctx.events().subscribe(&live.event);
    let caller_id = caller_id.to_string();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(payload) => {
                    let payload = match &live.transform {
                        Some(transform) => transform(payload),
                        None => payload,
                    };
                    match serde_json::from_value::<T>(payload) {
                        Ok(value) => {
                            cache.set(&key, value);
                        }
                        Err(e) => warn!("{caller_id}: ignoring {} payload: {e}", live.event),
                    }
                }
                Err(RecvError::Lagged(n)) => debug!("{caller_id}: missed {n} {} events", live.event),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

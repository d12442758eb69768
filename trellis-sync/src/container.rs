//! Synchronized containers.
//!
//! A [`SyncedContainer`] holds one immutable snapshot (`Arc<T>`) at a time.
//! Local commits bump `last_updated` and are handed to the transport
//! according to the container's [`Strategy`]; frames from other windows are
//! merged in and committed with [`Origin::Remote`], which never propagates
//! again.
//!
//! ```text
//!   set / update                       inbound task
//!        │                                  ▲
//!        ▼                                  │ SyncFrame (other windows)
//!   watch::Sender<ContainerState>  ──►  propagation task ──► ChannelLink
//!        │     (Immediate publishes inline)
//!        ▼
//!   subscribers (SyncBridge, UI)
//! ```
//!
//! Debounce and throttle run in a single propagation task per container, so
//! at most one propagation is in flight and mutations never wait on the
//! transport.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use log::{debug, trace, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::config::{Strategy, SyncOptions};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{filter_payload, merge_payload, SyncFrame};
use crate::transport::{ChannelLink, Frame, Transport, WindowId};

/// Values a container can hold and ship between windows.
pub trait SyncValue: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> SyncValue for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Shared handle to a registered container.
pub type Handle<T> = Arc<SyncedContainer<T>>;

/// Who produced the current snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// A committed snapshot. `data` is the only part that crosses the wire.
#[derive(Debug)]
pub struct ContainerState<T> {
    pub data: Option<Arc<T>>,
    /// Milliseconds since the Unix epoch, strictly increasing on local commits.
    pub last_updated: u64,
    pub revision: u64,
    pub origin: Origin,
}

impl<T> Clone for ContainerState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            last_updated: self.last_updated,
            revision: self.revision,
            origin: self.origin,
        }
    }
}

impl<T> ContainerState<T> {
    fn initial(data: Option<T>) -> Self {
        Self {
            data: data.map(Arc::new),
            last_updated: now_ms(),
            revision: 0,
            origin: Origin::Local,
        }
    }
}

/// Propagation statistics (snapshot).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub frames_published: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
}

#[derive(Default)]
struct AtomicContainerStats {
    frames_published: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Type-erased lifecycle, used by the registry.
pub trait Lifecycle: Send + Sync {
    fn id(&self) -> &str;
    fn start(&self);
    fn stop(&self);
    fn is_running(&self) -> bool;
    /// Stop and release the transport channel.
    fn teardown(&self) -> BoxFuture<'_, ()>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Encodes snapshots and hands them to the link.
struct Publisher {
    id: String,
    window: WindowId,
    filter_keys: BTreeSet<String>,
    link: ChannelLink,
    stats: Arc<AtomicContainerStats>,
}

impl Publisher {
    /// Errors are logged and counted, never returned to the committer.
    fn publish<T: SyncValue>(&self, state: &ContainerState<T>) {
        let Some(data) = state.data.as_deref() else {
            return;
        };
        match self.encode(data, state) {
            Ok(frame) => match self.link.publish(frame) {
                Ok(receivers) => {
                    self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
                    trace!("{} rev {} published to {receivers} receiver(s)", self.id, state.revision);
                }
                Err(e) => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("{}: propagation failed: {e}", self.id);
                }
            },
            Err(e) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("{}: skipping propagation: {e}", self.id);
            }
        }
    }

    fn encode<T: SyncValue>(&self, data: &T, state: &ContainerState<T>) -> SyncResult<Frame> {
        let payload = filter_payload(serde_json::to_value(data)?, &self.filter_keys);
        let frame = SyncFrame::state(self.window, &self.id, state.revision, state.last_updated, &payload)?;
        Ok(Arc::new(frame.encode()?))
    }
}

/// A named, cross-window synchronized state object.
pub struct SyncedContainer<T> {
    id: String,
    window: WindowId,
    options: SyncOptions,
    state: Arc<watch::Sender<ContainerState<T>>>,
    /// `None` when the transport was unavailable: local-only.
    publisher: Option<Arc<Publisher>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<AtomicContainerStats>,
    torn_down: AtomicBool,
}

impl<T: SyncValue> SyncedContainer<T> {
    /// Create a container bound to `id` on `transport`.
    ///
    /// A transport that cannot open the channel degrades the container to
    /// local-only; creation itself never fails.
    pub async fn open(
        id: impl Into<String>,
        initial: Option<T>,
        options: SyncOptions,
        transport: &dyn Transport,
    ) -> Handle<T> {
        let id = id.into();
        let window = transport.window_id();
        let stats = Arc::new(AtomicContainerStats::default());
        let (state, _) = watch::channel(ContainerState::initial(initial));
        let state = Arc::new(state);

        let publisher = match transport.open(&id, options.persist).await {
            Ok(link) => {
                let retained = link.retained();
                let publisher = Arc::new(Publisher {
                    id: id.clone(),
                    window,
                    filter_keys: options.filter_keys.clone(),
                    link,
                    stats: stats.clone(),
                });
                if let Some(frame) = retained {
                    debug!("{id}: hydrating from retained frame");
                    apply_frame(&state, &frame, &id, window, &options.filter_keys, &stats);
                }
                Some(publisher)
            }
            Err(SyncError::TransportUnavailable(reason)) => {
                warn!("{id}: running local-only ({reason})");
                None
            }
            Err(e) => {
                warn!("{id}: running local-only, open failed: {e}");
                None
            }
        };

        let container = Arc::new(Self {
            id,
            window,
            options,
            state,
            publisher,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            stats,
            torn_down: AtomicBool::new(false),
        });
        if container.options.auto_start {
            container.start();
        }
        container
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn window_id(&self) -> WindowId {
        self.window
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Whether a transport channel is bound.
    pub fn is_linked(&self) -> bool {
        self.publisher.is_some()
    }

    /// Current data.
    pub fn get(&self) -> Option<Arc<T>> {
        self.state.borrow().data.clone()
    }

    /// Current snapshot including metadata.
    pub fn snapshot(&self) -> ContainerState<T> {
        self.state.borrow().clone()
    }

    /// Timestamp (ms) of the latest commit, local or remote.
    pub fn last_updated(&self) -> u64 {
        self.state.borrow().last_updated
    }

    /// Commit a new value.
    pub fn set(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.set_shared(value.clone());
        value
    }

    /// Commit an existing reference. The container keeps this exact `Arc`.
    pub fn set_shared(&self, value: Arc<T>) {
        self.commit(Some(value));
    }

    /// Producer-style mutation: `f` edits a draft copy of the current value
    /// (or `T::default()`), which is then committed as a new snapshot.
    pub fn update<F>(&self, f: F) -> Arc<T>
    where
        T: Clone + Default,
        F: FnOnce(&mut T),
    {
        let mut draft = self.get().map(|v| (*v).clone()).unwrap_or_default();
        f(&mut draft);
        self.set(draft)
    }

    /// Drop the data locally. Clearing is not propagated.
    pub fn clear(&self) {
        self.state.send_modify(|s| {
            s.data = None;
            s.revision += 1;
            s.last_updated = next_timestamp(s.last_updated);
            s.origin = Origin::Local;
        });
    }

    /// Change notifications for every commit, local or remote.
    pub fn subscribe(&self) -> watch::Receiver<ContainerState<T>> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> ContainerStats {
        ContainerStats {
            frames_published: self.stats.frames_published.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }

    fn commit(&self, data: Option<Arc<T>>) {
        self.state.send_modify(|s| {
            s.data = data;
            s.revision += 1;
            s.last_updated = next_timestamp(s.last_updated);
            s.origin = Origin::Local;
        });

        if self.options.strategy == Strategy::Immediate && self.running.load(Ordering::Acquire) {
            if let Some(publisher) = &self.publisher {
                let snapshot = self.snapshot();
                publisher.publish(&snapshot);
            }
        }
    }

    /// Bind the inbound listener and (for debounce/throttle) the propagation task.
    pub fn start(&self) {
        let Some(publisher) = self.publisher.clone() else {
            return;
        };
        if self.torn_down.load(Ordering::Acquire) || self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };

        tasks.push(tokio::spawn(inbound_loop(
            publisher.link.subscribe(),
            self.state.clone(),
            self.id.clone(),
            self.window,
            self.options.filter_keys.clone(),
            self.stats.clone(),
        )));

        match self.options.strategy {
            Strategy::Immediate => {}
            Strategy::Debounce => tasks.push(tokio::spawn(debounce_loop(
                self.state.subscribe(),
                publisher,
                self.options.interval(),
            ))),
            Strategy::Throttle => tasks.push(tokio::spawn(throttle_loop(
                self.state.subscribe(),
                publisher,
                self.options.interval(),
            ))),
        }
        debug!("{} started ({:?}, {}ms)", self.id, self.options.strategy, self.options.interval_ms);
    }

    /// Stop future propagation and inbound delivery. Already-sent frames stay sent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks.drain(..) {
            task.abort();
        }
        debug!("{} stopped", self.id);
    }

    /// Whether the inbound listener and outbound scheduler are active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop and release the transport channel. Idempotent.
    pub async fn teardown(&self) {
        self.stop();
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.link.close().await {
                warn!("{}: channel teardown failed: {e}", self.id);
            }
        }
        debug!("{} torn down", self.id);
    }
}

impl<T: SyncValue> Lifecycle for SyncedContainer<T> {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&self) {
        SyncedContainer::start(self)
    }

    fn stop(&self) {
        SyncedContainer::stop(self)
    }

    fn is_running(&self) -> bool {
        SyncedContainer::is_running(self)
    }

    fn teardown(&self) -> BoxFuture<'_, ()> {
        Box::pin(SyncedContainer::teardown(self))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T> Drop for SyncedContainer<T> {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl<T> std::fmt::Debug for SyncedContainer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("SyncedContainer")
            .field("id", &self.id)
            .field("window", &self.window)
            .field("revision", &state.revision)
            .field("has_data", &state.data.is_some())
            .field("linked", &self.publisher.is_some())
            .finish()
    }
}

async fn inbound_loop<T: SyncValue>(
    mut rx: broadcast::Receiver<Frame>,
    state: Arc<watch::Sender<ContainerState<T>>>,
    id: String,
    window: WindowId,
    filter_keys: BTreeSet<String>,
    stats: Arc<AtomicContainerStats>,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => apply_frame(&state, &frame, &id, window, &filter_keys, &stats),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("{id}: inbound lagged, {skipped} frame(s) skipped");
                stats.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Decode a frame from another window and commit it as a remote snapshot.
/// Anything unreadable is "no update".
fn apply_frame<T: SyncValue>(
    state: &watch::Sender<ContainerState<T>>,
    frame: &[u8],
    id: &str,
    window: WindowId,
    filter_keys: &BTreeSet<String>,
    stats: &AtomicContainerStats,
) {
    let frame = match SyncFrame::decode(frame) {
        Ok(frame) => frame,
        Err(e) => {
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("{id}: dropping undecodable frame: {e}");
            return;
        }
    };
    if frame.origin == window || frame.channel != id {
        return;
    }

    let decoded = frame.payload_value().and_then(|remote| {
        let local = state
            .borrow()
            .data
            .as_deref()
            .map(serde_json::to_value)
            .transpose()?;
        Ok(serde_json::from_value::<T>(merge_payload(local, remote, filter_keys))?)
    });

    match decoded {
        Ok(value) => {
            stats.frames_received.fetch_add(1, Ordering::Relaxed);
            state.send_modify(|s| {
                s.data = Some(Arc::new(value));
                s.revision += 1;
                s.last_updated = frame.last_updated;
                s.origin = Origin::Remote;
            });
            trace!("{id}: applied remote rev {} from {}", frame.revision, frame.origin);
        }
        Err(e) => {
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("{id}: ignoring remote update: {e}");
        }
    }
}

/// Publish the latest local snapshot once commits have been quiet for `interval`.
async fn debounce_loop<T: SyncValue>(
    mut rx: watch::Receiver<ContainerState<T>>,
    publisher: Arc<Publisher>,
    interval: std::time::Duration,
) {
    loop {
        if rx.changed().await.is_err() {
            return;
        }
        if rx.borrow_and_update().origin != Origin::Local {
            continue;
        }

        let mut deadline = Instant::now() + interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    rx.borrow_and_update();
                    deadline = Instant::now() + interval;
                }
            }
        }

        let snapshot = rx.borrow().clone();
        // A remote snapshot that landed last wins; sending it back would echo.
        if snapshot.origin == Origin::Local {
            publisher.publish(&snapshot);
        }
    }
}

/// Publish at most once per `interval`, trailing edge included.
async fn throttle_loop<T: SyncValue>(
    mut rx: watch::Receiver<ContainerState<T>>,
    publisher: Arc<Publisher>,
    interval: std::time::Duration,
) {
    let mut published: Option<u64> = None;
    loop {
        if rx.changed().await.is_err() {
            return;
        }
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.origin != Origin::Local || published == Some(snapshot.revision) {
                break;
            }
            publisher.publish(&snapshot);
            published = Some(snapshot.revision);
            sleep(interval).await;
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn next_timestamp(previous: u64) -> u64 {
    now_ms().max(previous + 1)
}

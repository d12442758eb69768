//! Cross-window transport seam and the in-process hub.
//!
//! A [`Transport`] binds a container to a named channel and hands back a
//! [`ChannelLink`]. Each window gets an independent receiver that buffers up
//! to `channel_capacity` frames; a frame is fanned out to every window on
//! the channel, including the sender, and receivers drop their own frames by
//! origin.
//!
//! [`LocalHub`] is the in-process implementation used by tests and the
//! desktop host. [`DetachedTransport`] stands for "no host present": every
//! open fails with [`SyncError::TransportUnavailable`] and containers run
//! local-only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::{SyncError, SyncResult};

/// Identifies one window runtime.
pub type WindowId = Uuid;

/// An encoded [`SyncFrame`](crate::protocol::SyncFrame), shared between receivers.
pub type Frame = Arc<Vec<u8>>;

/// The host side of a single channel.
pub trait ChannelEndpoint: Send + Sync {
    /// Hand a frame to every window on the channel. Returns the receiver count.
    fn publish(&self, frame: Frame) -> SyncResult<usize>;

    /// A fresh receiver for frames published from now on.
    fn subscribe(&self) -> broadcast::Receiver<Frame>;

    /// Release the membership identified by `link_id`.
    fn detach(&self, link_id: Uuid) -> BoxFuture<'_, SyncResult<()>>;
}

/// Cross-window transport for one window.
pub trait Transport: Send + Sync + 'static {
    fn window_id(&self) -> WindowId;

    /// Bind to `channel`. With `persist`, the host retains the last frame.
    fn open<'a>(&'a self, channel: &'a str, persist: bool) -> BoxFuture<'a, SyncResult<ChannelLink>>;
}

/// A window's membership in a channel.
pub struct ChannelLink {
    link_id: Uuid,
    channel: String,
    endpoint: Arc<dyn ChannelEndpoint>,
    retained: Option<Frame>,
}

impl ChannelLink {
    /// A link under a fresh id.
    pub fn new(channel: impl Into<String>, endpoint: Arc<dyn ChannelEndpoint>, retained: Option<Frame>) -> Self {
        Self::with_id(Uuid::new_v4(), channel, endpoint, retained)
    }

    /// A link whose id the host already registered.
    pub fn with_id(
        link_id: Uuid,
        channel: impl Into<String>,
        endpoint: Arc<dyn ChannelEndpoint>,
        retained: Option<Frame>,
    ) -> Self {
        Self {
            link_id,
            channel: channel.into(),
            endpoint,
            retained,
        }
    }

    /// Channel (container id) this link is bound to.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Membership id, unique per open.
    pub fn link_id(&self) -> Uuid {
        self.link_id
    }

    /// Last frame the host retained for this channel when the link was opened.
    pub fn retained(&self) -> Option<Frame> {
        self.retained.clone()
    }

    /// Fan a frame out to the channel. Returns the receiver count.
    pub fn publish(&self, frame: Frame) -> SyncResult<usize> {
        self.endpoint.publish(frame)
    }

    /// Receiver for frames published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.endpoint.subscribe()
    }

    /// Tear the membership down.
    pub async fn close(&self) -> SyncResult<()> {
        self.endpoint.detach(self.link_id).await
    }
}

impl std::fmt::Debug for ChannelLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLink")
            .field("link_id", &self.link_id)
            .field("channel", &self.channel)
            .field("retained", &self.retained.is_some())
            .finish()
    }
}

/// Statistics for monitoring a channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub active_links: usize,
    pub retains: bool,
}

/// One channel on the hub: broadcast sender + membership + retained frame.
pub struct ChannelGroup {
    sender: broadcast::Sender<Frame>,
    /// link id → owning window
    links: RwLock<HashMap<Uuid, WindowId>>,
    retained: Mutex<Option<Frame>>,
    retain: AtomicBool,
    frames_sent: AtomicU64,
    capacity: usize,
}

impl ChannelGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            links: RwLock::new(HashMap::new()),
            retained: Mutex::new(None),
            retain: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
            capacity,
        }
    }

    async fn attach(&self, link_id: Uuid, window: WindowId, persist: bool) -> Option<Frame> {
        self.links.write().await.insert(link_id, window);
        if persist {
            self.retain.store(true, Ordering::Release);
        }
        self.retained()
    }

    /// Frame kept for late joiners, if the channel retains.
    pub fn retained(&self) -> Option<Frame> {
        self.retained.lock().ok().and_then(|slot| slot.clone())
    }

    /// Open links, counting several per window.
    pub async fn link_count(&self) -> usize {
        self.links.read().await.len()
    }

    /// Windows currently linked (a window may hold several links).
    pub async fn windows(&self) -> Vec<WindowId> {
        let mut windows: Vec<WindowId> = self.links.read().await.values().copied().collect();
        windows.sort();
        windows.dedup();
        windows
    }

    /// Whether any link asked for the last frame to be kept.
    pub fn retains(&self) -> bool {
        self.retain.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get channel statistics.
    pub async fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_links: self.link_count().await,
            retains: self.retains(),
        }
    }
}

impl ChannelEndpoint for ChannelGroup {
    fn publish(&self, frame: Frame) -> SyncResult<usize> {
        if self.retains() {
            if let Ok(mut slot) = self.retained.lock() {
                *slot = Some(frame.clone());
            }
        }
        // No receivers is not an error: nobody else has the channel open yet.
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(count)
    }

    fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    fn detach(&self, link_id: Uuid) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move {
            self.links.write().await.remove(&link_id);
            Ok(())
        })
    }
}

/// In-process hub: maps channel names to channel groups.
///
/// Every window of the process opens its containers through a
/// [`HubTransport`] pointing at the same hub.
pub struct LocalHub {
    channels: RwLock<HashMap<String, Arc<ChannelGroup>>>,
    config: HubConfig,
}

impl LocalHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// A transport for a new window on this hub.
    pub fn connect(self: &Arc<Self>) -> Arc<HubTransport> {
        Arc::new(HubTransport {
            hub: self.clone(),
            window: Uuid::new_v4(),
        })
    }

    /// Get or create the group for `channel`.
    pub async fn get_or_create(&self, channel: &str) -> Arc<ChannelGroup> {
        {
            let channels = self.channels.read().await;
            if let Some(group) = channels.get(channel) {
                return group.clone();
            }
        }

        let mut channels = self.channels.write().await;
        // Double-check after acquiring the write lock
        if let Some(group) = channels.get(channel) {
            return group.clone();
        }

        let group = Arc::new(ChannelGroup::new(self.config.channel_capacity));
        channels.insert(channel.to_string(), group.clone());
        group
    }

    /// Link `window` to `channel`, creating the group if needed.
    ///
    /// Lookup and attach happen under the table's write lock, so a
    /// concurrent [`remove_if_idle`](Self::remove_if_idle) either runs
    /// before (and the group is recreated) or sees the new link.
    pub async fn attach(
        &self,
        channel: &str,
        link_id: Uuid,
        window: WindowId,
        persist: bool,
    ) -> (Arc<ChannelGroup>, Option<Frame>) {
        let mut channels = self.channels.write().await;
        let group = channels
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(ChannelGroup::new(self.config.channel_capacity)))
            .clone();
        let retained = group.attach(link_id, window, persist).await;
        (group, retained)
    }

    /// The group for `channel`, without creating it.
    pub async fn channel(&self, channel: &str) -> Option<Arc<ChannelGroup>> {
        self.channels.read().await.get(channel).cloned()
    }

    /// Drop a channel nobody is linked to, unless it retains a frame.
    pub async fn remove_if_idle(&self, channel: &str) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(group) = channels.get(channel) {
            if group.link_count().await == 0 && !group.retains() {
                channels.remove(channel);
                return true;
            }
        }
        false
    }

    /// Number of live channels.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Live channel names, sorted.
    pub async fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Hub-backed endpoint that also prunes idle channels on detach.
struct HubEndpoint {
    hub: Arc<LocalHub>,
    channel: String,
    group: Arc<ChannelGroup>,
}

impl ChannelEndpoint for HubEndpoint {
    fn publish(&self, frame: Frame) -> SyncResult<usize> {
        self.group.publish(frame)
    }

    fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.group.subscribe()
    }

    fn detach(&self, link_id: Uuid) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move {
            self.group.detach(link_id).await?;
            self.hub.remove_if_idle(&self.channel).await;
            Ok(())
        })
    }
}

/// One window's view of a [`LocalHub`].
pub struct HubTransport {
    hub: Arc<LocalHub>,
    window: WindowId,
}

impl HubTransport {
    /// Hub this window is connected to.
    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }
}

impl Transport for HubTransport {
    fn window_id(&self) -> WindowId {
        self.window
    }

    fn open<'a>(&'a self, channel: &'a str, persist: bool) -> BoxFuture<'a, SyncResult<ChannelLink>> {
        Box::pin(async move {
            let link_id = Uuid::new_v4();
            let (group, retained) = self.hub.attach(channel, link_id, self.window, persist).await;
            let endpoint = Arc::new(HubEndpoint {
                hub: self.hub.clone(),
                channel: channel.to_string(),
                group,
            });
            Ok(ChannelLink::with_id(link_id, channel, endpoint, retained))
        })
    }
}

/// A window without a cross-window host.
pub struct DetachedTransport {
    window: WindowId,
}

impl DetachedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { window: Uuid::new_v4() })
    }
}

impl Transport for DetachedTransport {
    fn window_id(&self) -> WindowId {
        self.window
    }

    fn open<'a>(&'a self, channel: &'a str, _persist: bool) -> BoxFuture<'a, SyncResult<ChannelLink>> {
        Box::pin(async move {
            Err(SyncError::TransportUnavailable(format!(
                "no cross-window host for channel {channel}"
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_links_window() {
        let hub = LocalHub::new(HubConfig::default());
        let transport = hub.connect();

        let link = transport.open("battery-store", false).await.unwrap();
        assert_eq!(link.channel(), "battery-store");
        assert!(link.retained().is_none());

        let group = hub.channel("battery-store").await.unwrap();
        assert_eq!(group.link_count().await, 1);
        assert_eq!(group.windows().await, vec![transport.window_id()]);
    }

    #[tokio::test]
    async fn test_fan_out_to_every_window() {
        let hub = LocalHub::new(HubConfig::default());
        let a = hub.connect();
        let b = hub.connect();

        let link_a = a.open("weather-store", false).await.unwrap();
        let link_b = b.open("weather-store", false).await.unwrap();
        let mut rx_a = link_a.subscribe();
        let mut rx_b = link_b.subscribe();

        let count = link_a.publish(Arc::new(vec![1, 2, 3])).unwrap();
        // Sender receives its own frame too — filtering by origin is the receiver's job
        assert_eq!(count, 2);
        assert_eq!(*rx_a.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*rx_b.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let hub = LocalHub::new(HubConfig::default());
        let t = hub.connect();

        let battery = t.open("battery-store", false).await.unwrap();
        let weather = t.open("weather-store", false).await.unwrap();
        let mut weather_rx = weather.subscribe();

        battery.publish(Arc::new(vec![9])).unwrap();
        assert!(weather_rx.try_recv().is_err());
        assert_eq!(hub.channel_count().await, 2);
    }

    #[tokio::test]
    async fn test_persisted_channel_retains_last_frame() {
        let hub = LocalHub::new(HubConfig::default());
        let a = hub.connect();
        let link = a.open("config-store", true).await.unwrap();

        link.publish(Arc::new(vec![1])).unwrap();
        link.publish(Arc::new(vec![2])).unwrap();
        link.close().await.unwrap();

        // Retaining channels survive their last link
        assert_eq!(hub.channel_count().await, 1);

        let b = hub.connect();
        let late = b.open("config-store", false).await.unwrap();
        assert_eq!(late.retained().map(|f| (*f).clone()), Some(vec![2]));
    }

    #[tokio::test]
    async fn test_close_prunes_idle_channel() {
        let hub = LocalHub::new(HubConfig::default());
        let t = hub.connect();
        let first = t.open("media-store", false).await.unwrap();
        let second = t.open("media-store", false).await.unwrap();

        first.close().await.unwrap();
        assert_eq!(hub.channel_count().await, 1);

        second.close().await.unwrap();
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_group_stats() {
        let hub = LocalHub::new(HubConfig { channel_capacity: 32 });
        let t = hub.connect();
        let link = t.open("battery-store", false).await.unwrap();
        link.publish(Arc::new(vec![1])).unwrap();
        link.publish(Arc::new(vec![2])).unwrap();

        let group = hub.channel("battery-store").await.unwrap();
        let stats = group.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.active_links, 1);
        assert!(!stats.retains);
        assert_eq!(group.capacity(), 32);
    }

    #[tokio::test]
    async fn test_attach_registers_link_in_table() {
        let hub = LocalHub::new(HubConfig::default());
        let window = Uuid::new_v4();
        let (group, retained) = hub.attach("weather-store", Uuid::new_v4(), window, false).await;

        assert!(retained.is_none());
        assert_eq!(group.windows().await, vec![window]);
        let listed = hub.channel("weather-store").await.unwrap();
        assert!(Arc::ptr_eq(&listed, &group));
        // A linked group is never idle
        assert!(!hub.remove_if_idle("weather-store").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_open_racing_close_stays_on_one_group() {
        let hub = LocalHub::new(HubConfig::default());
        let a = hub.connect();
        let b = hub.connect();
        let c = hub.connect();

        for i in 0..200u32 {
            let channel = format!("churn-{i}-store");
            let leaving = b.open(&channel, false).await.unwrap();

            let closer = tokio::spawn(async move { leaving.close().await });
            let joined = a.open(&channel, false).await.unwrap();
            closer.await.unwrap().unwrap();

            let late = c.open(&channel, false).await.unwrap();
            let mut rx = late.subscribe();
            let payload = i.to_le_bytes().to_vec();
            joined.publish(Arc::new(payload.clone())).unwrap();
            assert_eq!(*rx.try_recv().unwrap(), payload, "split channel at iteration {i}");

            joined.close().await.unwrap();
            late.close().await.unwrap();
        }
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_detached_transport_is_unavailable() {
        let t = DetachedTransport::new();
        let err = t.open("battery-store", false).await.unwrap_err();
        assert!(matches!(err, SyncError::TransportUnavailable(_)));
    }
}

//! Simulated desktop window.
//!
//! Each window owns a [`SyncContext`] on the shared hub and mounts the
//! battery query. The primary window talks to the host (command + live
//! event); secondary windows only ever learn the battery level from their
//! siblings.
//!
//! ```text
//!  host battery-changed event
//!       │
//!       ▼
//!  primary window cache ──► SyncBridge ──► container ──► hub
//!                                                         │
//!       ┌─────────────────────────────────────────────────┘
//!       ▼
//!  secondary window container ──► SyncBridge ──► cache ──► observer log
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use trellis_sync::{
    CacheEvent, CommandInvoker, ContextConfig, EventSource, LocalHub, QueryOptions, SyncContext, SyncResult,
    SyncedQuery,
};

pub const BATTERY_COMMAND: &str = "get_battery";
pub const BATTERY_EVENT: &str = "battery-changed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub percentage: u8,
    pub charging: bool,
}

pub fn battery_key() -> Vec<Value> {
    vec![json!("battery")]
}

/// Host facilities handed to the primary window.
pub struct Host {
    pub commands: Arc<dyn CommandInvoker>,
    pub events: Arc<dyn EventSource>,
}

pub struct DesktopWindow {
    label: String,
    ctx: Arc<SyncContext>,
    battery: SyncedQuery<Battery>,
    observer: JoinHandle<()>,
    /// Battery values this window's cache has seen.
    observed: Arc<AtomicU64>,
}

impl DesktopWindow {
    /// Open a window on `hub`. With `host` the window fetches and follows
    /// the battery itself.
    pub async fn open(
        label: impl Into<String>,
        hub: &Arc<LocalHub>,
        config: &ContextConfig,
        host: Option<&Host>,
    ) -> SyncResult<Self> {
        let label = label.into();
        let mut ctx = SyncContext::with_config(hub.connect(), config.clone());
        let mut options = QueryOptions::new(battery_key());
        match host {
            Some(host) => {
                ctx = ctx.with_commands(host.commands.clone()).with_events(host.events.clone());
                options = options.command(BATTERY_COMMAND, Value::Null).live_event(BATTERY_EVENT);
            }
            None => options = options.fetch_on_mount(false),
        }
        let ctx = Arc::new(ctx);

        let observed = Arc::new(AtomicU64::new(0));
        let observer = spawn_observer(label.clone(), &ctx, observed.clone());
        let battery = SyncedQuery::mount(ctx.clone(), options).await?;
        info!("[{label}] opened as window {}", ctx.window_id());

        Ok(Self {
            label,
            ctx,
            battery,
            observer,
            observed,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn battery(&self) -> Option<Arc<Battery>> {
        self.battery.data()
    }

    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }

    pub fn set_sync_enabled(&self, enabled: bool) {
        info!("[{}] sync {}", self.label, if enabled { "enabled" } else { "disabled" });
        self.battery.set_sync_enabled(enabled);
    }

    pub async fn close(self) {
        let Self {
            label,
            ctx,
            battery,
            observer,
            ..
        } = self;
        observer.abort();
        battery.unmount();
        ctx.shutdown().await;
        info!("[{label}] closed");
    }
}

/// Log every battery value that lands in the window's cache.
fn spawn_observer(label: String, ctx: &Arc<SyncContext>, observed: Arc<AtomicU64>) -> JoinHandle<()> {
    let cache = ctx.cache().clone();
    let battery_id = cache.id_for(&battery_key());
    let mut changes = cache.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(CacheEvent::Updated { id }) if id == battery_id => {
                    if let Some(battery) = cache.get::<Battery>(&battery_key()) {
                        observed.fetch_add(1, Ordering::Relaxed);
                        info!(
                            "[{label}] battery {}%{}",
                            battery.percentage,
                            if battery.charging { " (charging)" } else { "" }
                        );
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use trellis_sync::{CommandTable, EventBus, HubConfig};

    fn host(bus: Arc<EventBus>) -> Host {
        let commands = CommandTable::new();
        commands.register(BATTERY_COMMAND, |_| async { Ok(json!({"percentage": 76, "charging": false})) });
        Host {
            commands: Arc::new(commands),
            events: bus,
        }
    }

    #[tokio::test]
    async fn test_secondary_window_follows_primary() {
        let hub = LocalHub::new(HubConfig::default());
        let bus = Arc::new(EventBus::default());
        let config = ContextConfig::default();

        let primary = DesktopWindow::open("main", &hub, &config, Some(&host(bus.clone()))).await.unwrap();
        let secondary = DesktopWindow::open("tray", &hub, &config, None).await.unwrap();
        assert_eq!(primary.battery().unwrap().percentage, 76);

        bus.emit(BATTERY_EVENT, json!({"percentage": 75, "charging": true}));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            *secondary.battery().unwrap(),
            Battery { percentage: 75, charging: true }
        );
        assert!(secondary.observed() >= 1);

        primary.close().await;
        secondary.close().await;
    }

    #[tokio::test]
    async fn test_disabled_window_stays_behind() {
        let hub = LocalHub::new(HubConfig::default());
        let bus = Arc::new(EventBus::default());
        let config = ContextConfig::default();

        let primary = DesktopWindow::open("main", &hub, &config, Some(&host(bus.clone()))).await.unwrap();
        let secondary = DesktopWindow::open("tray", &hub, &config, None).await.unwrap();
        secondary.set_sync_enabled(false);

        bus.emit(BATTERY_EVENT, json!({"percentage": 50, "charging": false}));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(secondary.battery().is_none());
        assert_eq!(primary.battery().unwrap().percentage, 50);
    }
}

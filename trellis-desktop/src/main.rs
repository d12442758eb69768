//! Trellis Desktop — demo host for cross-window query sync.
//!
//! Opens several simulated windows on one in-process hub. The primary
//! window reads the battery through a host command and follows the host's
//! `battery-changed` event; every other window receives the value through
//! the sync layer without ever calling the host.

mod config;
mod window;

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde_json::json;
use trellis_sync::{CommandTable, EventBus, LocalHub};

use config::DesktopConfig;
use window::{Battery, DesktopWindow, Host, BATTERY_COMMAND, BATTERY_EVENT};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = DesktopConfig::from_env()?;
    info!("Starting Trellis Desktop: {} windows, {} ticks", config.windows, config.ticks);

    let hub = LocalHub::new(config.hub.clone());
    let bus = Arc::new(EventBus::default());
    let commands = CommandTable::new();
    commands.register(BATTERY_COMMAND, |_| async { Ok(json!({"percentage": 100, "charging": false})) });
    let host = Host {
        commands: Arc::new(commands),
        events: bus.clone(),
    };

    let mut windows = Vec::with_capacity(config.windows.max(1));
    windows.push(DesktopWindow::open("main", &hub, &config.context, Some(&host)).await?);
    for i in 1..config.windows.max(1) {
        windows.push(DesktopWindow::open(format!("window-{i}"), &hub, &config.context, None).await?);
    }

    let tick = Duration::from_millis(config.tick_ms);
    for i in 1..=config.ticks {
        tokio::time::sleep(tick).await;
        let battery = Battery {
            percentage: 100u8.saturating_sub(i.min(100) as u8),
            charging: i % 4 == 0,
        };
        let receivers = bus.emit(BATTERY_EVENT, serde_json::to_value(&battery)?);
        info!("host: battery {}% ({receivers} listeners)", battery.percentage);
    }
    tokio::time::sleep(tick).await;

    let expected = windows[0].battery();
    for w in &windows {
        match w.battery() {
            Some(b) if Some(&b) == expected.as_ref() => {
                info!("[{}] in sync at {}% after {} updates", w.label(), b.percentage, w.observed())
            }
            Some(b) => warn!("[{}] behind at {}%", w.label(), b.percentage),
            None => warn!("[{}] never received a battery value", w.label()),
        }
    }

    for w in windows {
        w.close().await;
    }
    info!("hub channels left open: {}", hub.channel_count().await);
    Ok(())
}

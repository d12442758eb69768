//! Demo host configuration, optionally read from the JSON file named by
//! `TRELLIS_CONFIG`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use trellis_sync::{ContextConfig, HubConfig};

pub const CONFIG_ENV: &str = "TRELLIS_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DesktopConfig {
    /// Windows to open, including the primary one.
    pub windows: usize,
    /// Simulated battery changes emitted by the host.
    pub ticks: u32,
    pub tick_ms: u64,
    pub hub: HubConfig,
    pub context: ContextConfig,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            windows: 3,
            ticks: 5,
            tick_ms: 200,
            hub: HubConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

impl DesktopConfig {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

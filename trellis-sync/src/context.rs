//! Per-window bundle of everything a query needs.
//!
//! Built once per window and shared as `Arc<SyncContext>`. Queries, the
//! registry and the cache all hang off it.

use std::sync::Arc;

use log::info;

use crate::cache::QueryCache;
use crate::codec::QueryKeyCodec;
use crate::config::ContextConfig;
use crate::host::{CommandInvoker, CommandTable, EventBus, EventSource};
use crate::registry::StoreRegistry;
use crate::transport::{Transport, WindowId};

pub struct SyncContext {
    window: WindowId,
    config: ContextConfig,
    codec: QueryKeyCodec,
    registry: StoreRegistry,
    cache: QueryCache,
    commands: Arc<dyn CommandInvoker>,
    events: Arc<dyn EventSource>,
}

impl SyncContext {
    /// Context on `transport` with default configuration, an empty command
    /// table and a fresh event bus.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ContextConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: ContextConfig) -> Self {
        let codec = QueryKeyCodec::new(config.key_encoding);
        let window = transport.window_id();
        info!("window {window}: sync context ready ({:?} keys)", config.key_encoding);
        Self {
            window,
            codec,
            registry: StoreRegistry::new(transport),
            cache: QueryCache::new(codec, config.cache_event_capacity),
            commands: Arc::new(CommandTable::new()),
            events: Arc::new(EventBus::default()),
            config,
        }
    }

    pub fn with_commands(mut self, commands: Arc<dyn CommandInvoker>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSource>) -> Self {
        self.events = events;
        self
    }

    pub fn window_id(&self) -> WindowId {
        self.window
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn codec(&self) -> QueryKeyCodec {
        self.codec
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Host commands used by `Fetcher::Command`.
    pub fn commands(&self) -> &Arc<dyn CommandInvoker> {
        &self.commands
    }

    /// Host events feeding live queries.
    pub fn events(&self) -> &Arc<dyn EventSource> {
        &self.events
    }

    /// Tear down every container this window registered.
    pub async fn shutdown(&self) {
        self.registry.destroy_all().await;
        info!("window {}: sync context shut down", self.window);
    }
}

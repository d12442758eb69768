//! Host facilities a query consumes: command invocation and event delivery.
//!
//! A desktop shell provides both natively. [`CommandTable`] and [`EventBus`]
//! are the in-process versions.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use log::debug;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{SyncError, SyncResult};

/// Invokes a named host command with JSON arguments.
pub trait CommandInvoker: Send + Sync {
    fn invoke<'a>(&'a self, name: &'a str, args: Value) -> BoxFuture<'a, SyncResult<Value>>;
}

/// Subscribes to named host events carrying JSON payloads.
pub trait EventSource: Send + Sync {
    fn subscribe(&self, event: &str) -> broadcast::Receiver<Value>;
}

type CommandHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, SyncResult<Value>> + Send + Sync>;

/// Command name → async handler.
#[derive(Default)]
pub struct CommandTable {
    handlers: DashMap<String, CommandHandler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `name`.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<Value>> + Send + 'static,
    {
        let boxed: CommandHandler =
            Arc::new(move |args| -> BoxFuture<'static, SyncResult<Value>> { Box::pin(handler(args)) });
        self.handlers.insert(name.into(), boxed);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

impl CommandInvoker for CommandTable {
    fn invoke<'a>(&'a self, name: &'a str, args: Value) -> BoxFuture<'a, SyncResult<Value>> {
        // Clone out of the map so no shard lock is held across the await.
        let handler = self.handlers.get(name).map(|h| h.value().clone());
        Box::pin(async move {
            let handler = handler.ok_or_else(|| SyncError::Command {
                name: name.to_string(),
                message: "not registered".to_string(),
            })?;
            debug!("invoking command {name}");
            handler(args).await
        })
    }
}

/// Named broadcast channels for host events.
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<Value>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, event: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .value()
            .clone()
    }

    /// Deliver `payload` to every subscriber of `event`. Returns the receiver count.
    pub fn emit(&self, event: &str, payload: Value) -> usize {
        self.sender(event).send(payload).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSource for EventBus {
    fn subscribe(&self, event: &str) -> broadcast::Receiver<Value> {
        self.sender(event).subscribe()
    }
}

//! Configuration for containers, the in-process hub and a window context.
//!
//! Every struct has a `Default` that works out of the box and derives
//! `Deserialize` with field defaults, so a host can load a partial JSON
//! document and only override what it cares about.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::KeyEncoding;
use crate::error::SyncResult;

/// When a committed snapshot is handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Publish synchronously after every commit.
    Immediate,
    /// Publish the latest snapshot after `interval_ms` without commits.
    #[default]
    Debounce,
    /// Publish at most once per `interval_ms`.
    Throttle,
}

/// Per-container sync options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Bind the inbound listener and propagation task on creation.
    pub auto_start: bool,
    pub strategy: Strategy,
    /// Debounce quiescence / throttle window, in milliseconds.
    pub interval_ms: u64,
    /// Ask the host to retain the last frame so later windows hydrate from it.
    pub persist: bool,
    /// Top-level fields of the serialized data that never go on the wire.
    pub filter_keys: BTreeSet<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            auto_start: true,
            strategy: Strategy::Debounce,
            interval_ms: 50,
            persist: false,
            filter_keys: BTreeSet::new(),
        }
    }
}

impl SyncOptions {
    pub fn immediate() -> Self {
        Self {
            strategy: Strategy::Immediate,
            interval_ms: 0,
            ..Default::default()
        }
    }

    pub fn debounce(interval_ms: u64) -> Self {
        Self {
            strategy: Strategy::Debounce,
            interval_ms,
            ..Default::default()
        }
    }

    pub fn throttle(interval_ms: u64) -> Self {
        Self {
            strategy: Strategy::Throttle,
            interval_ms,
            ..Default::default()
        }
    }

    pub fn with_filter_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// In-process hub configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Frames buffered per receiver before a lagging window drops frames.
    pub channel_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { channel_capacity: 256 }
    }
}

/// Per-window context configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub key_encoding: KeyEncoding,
    /// Options used by queries that do not bring their own.
    pub query_sync: SyncOptions,
    /// Cache change notifications buffered per subscriber.
    pub cache_event_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            key_encoding: KeyEncoding::InsertionOrder,
            query_sync: SyncOptions::default(),
            cache_event_capacity: 256,
        }
    }
}

impl ContextConfig {
    /// Parse a (possibly partial) JSON document.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

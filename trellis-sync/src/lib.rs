//! # trellis-sync — Cross-window query state synchronization
//!
//! Keeps query-keyed state consistent across the windows of one desktop
//! application without a central server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   sync()   ┌─────────────┐   frames   ┌─────────────┐
//! │ QueryCache  │ ◄────────► │ SyncBridge  │ ─────────► │ Synced-     │
//! │ (window A)  │            │ (per key)   │            │ Container   │
//! └─────────────┘            └─────────────┘            └──────┬──────┘
//!                                                              │
//!                                                      ┌───────┴───────┐
//!                                                      │ Transport     │
//!                                                      │ (LocalHub)    │
//!                                                      └───────┬───────┘
//!                                                              │
//! ┌─────────────┐            ┌─────────────┐            ┌──────┴──────┐
//! │ QueryCache  │ ◄───────── │ SyncBridge  │ ◄───────── │ Synced-     │
//! │ (window B)  │            │ (per key)   │            │ Container   │
//! └─────────────┘            └─────────────┘            └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — Query key → stable string id
//! - [`protocol`] — Binary wire frame (bincode-encoded SyncFrame)
//! - [`transport`] — Transport trait, in-process hub, detached fallback
//! - [`container`] — Synced container with immediate/debounce/throttle propagation
//! - [`registry`] — Idempotent container lifecycle per window
//! - [`cache`] — Reactive query cache
//! - [`bridge`] — Cache ⇄ container adapter with echo suppression
//! - [`host`] — Host command and event collaborators
//! - [`query`] — Fetch hook wiring it all together
//! - [`context`] — Per-window bundle

pub mod bridge;
pub mod cache;
pub mod codec;
pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod host;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod transport;

// Re-exports for convenience
pub use bridge::SyncBridge;
pub use cache::{CacheEvent, QueryCache};
pub use codec::{KeyEncoding, QueryKey, QueryKeyCodec, container_id, encode, encode_canonical};
pub use config::{ContextConfig, HubConfig, Strategy, SyncOptions};
pub use container::{ContainerState, ContainerStats, Handle, Lifecycle, Origin, SyncValue, SyncedContainer};
pub use context::SyncContext;
pub use error::{SyncError, SyncResult};
pub use host::{CommandInvoker, CommandTable, EventBus, EventSource};
pub use protocol::{SyncFrame, filter_payload, merge_payload};
pub use query::{Fetcher, QueryOptions, SyncedQuery, Transform};
pub use registry::StoreRegistry;
pub use transport::{
    ChannelEndpoint, ChannelGroup, ChannelLink, ChannelStats, DetachedTransport, Frame, HubTransport, LocalHub,
    Transport, WindowId,
};

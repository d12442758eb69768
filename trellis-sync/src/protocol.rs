//! Wire frame for container state propagation.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌───────────┬──────────┬──────────┬──────────────┬──────────────┐
//! │ origin    │ channel  │ revision │ last_updated │ payload      │
//! │ 16 bytes  │ variable │ varint   │ varint       │ JSON bytes   │
//! └───────────┴──────────┴──────────┴──────────────┴──────────────┘
//! ```
//!
//! The payload is the container's data serialized to JSON with the
//! container's filtered keys removed. JSON keeps the payload readable by
//! hosts written in anything, bincode keeps the envelope small.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// One state snapshot travelling between windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFrame {
    /// Window that committed the snapshot.
    pub origin: Uuid,
    /// Container id the snapshot belongs to.
    pub channel: String,
    /// Sender-local revision counter.
    pub revision: u64,
    /// Sender's `last_updated` timestamp (ms since the Unix epoch).
    pub last_updated: u64,
    pub payload: Vec<u8>,
}

impl SyncFrame {
    /// Build a state frame from an already filtered JSON payload.
    pub fn state(
        origin: Uuid,
        channel: impl Into<String>,
        revision: u64,
        last_updated: u64,
        payload: &Value,
    ) -> SyncResult<Self> {
        Ok(Self {
            origin,
            channel: channel.into(),
            revision,
            last_updated,
            payload: serde_json::to_vec(payload)?,
        })
    }

    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Codec(e.to_string()))?;
        Ok(frame)
    }

    /// Parse the JSON payload.
    pub fn payload_value(&self) -> SyncResult<Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Drop `filter_keys` from a top-level JSON object. Non-objects pass through.
pub fn filter_payload(mut value: Value, filter_keys: &BTreeSet<String>) -> Value {
    if filter_keys.is_empty() {
        return value;
    }
    if let Value::Object(map) = &mut value {
        map.retain(|k, _| !filter_keys.contains(k));
    }
    value
}

/// Overlay a remote payload on the local value.
///
/// The remote value is authoritative. When both sides are objects, only the
/// `keep` fields (the ones stripped before sending) are carried over from the
/// local value, and only when the remote value lacks them. A field the sender
/// removed is therefore removed here too.
pub fn merge_payload(local: Option<Value>, remote: Value, keep: &BTreeSet<String>) -> Value {
    if keep.is_empty() {
        return remote;
    }
    match (local, remote) {
        (Some(Value::Object(mut base)), Value::Object(mut incoming)) => {
            for k in keep {
                if incoming.contains_key(k) {
                    continue;
                }
                if let Some(v) = base.remove(k) {
                    incoming.insert(k.clone(), v);
                }
            }
            Value::Object(incoming)
        }
        (_, remote) => remote,
    }
}

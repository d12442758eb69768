//! Query key → container id derivation.
//!
//! A query key is an ordered list of JSON values. Its caller id is
//! `query-<JSON(key)>` and the registry stores it under `<caller id>-store`.
//!
//! Two encodings exist:
//!
//! - [`KeyEncoding::InsertionOrder`] (the default) serializes object parts in
//!   the order their fields were inserted. `{"a":1,"b":2}` and `{"b":2,"a":1}`
//!   map to different ids.
//! - [`KeyEncoding::Canonical`] sorts object fields recursively first, so
//!   structurally equal keys always map to the same id. Opt-in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered, JSON-serializable identifier for a query cache entry.
pub type QueryKey = Vec<Value>;

/// Prefix of every query-derived caller id.
pub const QUERY_PREFIX: &str = "query-";

/// Suffix appended by the registry to every caller id.
pub const STORE_SUFFIX: &str = "-store";

/// How object-valued key parts are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEncoding {
    /// Field insertion order, exactly as the key was built.
    #[default]
    InsertionOrder,
    /// Object fields sorted recursively.
    Canonical,
}

/// Derives stable string identities from query keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryKeyCodec {
    encoding: KeyEncoding,
}

impl QueryKeyCodec {
    pub fn new(encoding: KeyEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> KeyEncoding {
        self.encoding
    }

    /// Encode a key with this codec's encoding.
    pub fn caller_id(&self, key: &[Value]) -> String {
        match self.encoding {
            KeyEncoding::InsertionOrder => encode(key),
            KeyEncoding::Canonical => encode_canonical(key),
        }
    }
}

/// `"query-" + JSON(key)`, object fields in insertion order.
pub fn encode(key: &[Value]) -> String {
    // Serializing a slice of `Value` cannot fail: keys are always strings.
    let json = serde_json::to_string(key).unwrap_or_else(|_| String::from("[]"));
    format!("{QUERY_PREFIX}{json}")
}

/// `"query-" + JSON(key)` with every object's fields sorted recursively.
pub fn encode_canonical(key: &[Value]) -> String {
    let sorted: Vec<Value> = key.iter().map(canonicalize).collect();
    encode(&sorted)
}

/// The registry id for a caller id.
pub fn container_id(caller_id: &str) -> String {
    format!("{caller_id}{STORE_SUFFIX}")
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

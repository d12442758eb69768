//! Reactive query cache for one window.
//!
//! Values are stored as `Arc<T>` behind `dyn Any`, so a value read back with
//! [`QueryCache::get`] is the very allocation that was written. The sync
//! bridge relies on that: change detection is `Arc::ptr_eq`, and a writer
//! must hand in a new `Arc` for every logical change.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use log::trace;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::codec::QueryKeyCodec;

/// Change notification for one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Updated { id: String },
    Removed { id: String },
}

impl CacheEvent {
    pub fn id(&self) -> &str {
        match self {
            CacheEvent::Updated { id } | CacheEvent::Removed { id } => id,
        }
    }
}

/// Cheaply cloneable handle; clones share the same entries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    entries: DashMap<String, Arc<dyn Any + Send + Sync>>,
    events: broadcast::Sender<CacheEvent>,
    codec: QueryKeyCodec,
}

impl QueryCache {
    pub fn new(codec: QueryKeyCodec, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                events,
                codec,
            }),
        }
    }

    /// Entry id for a query key.
    pub fn id_for(&self, key: &[Value]) -> String {
        self.inner.codec.caller_id(key)
    }

    /// Stored value for `key`, or `None` if absent or of another type.
    pub fn get<T: Send + Sync + 'static>(&self, key: &[Value]) -> Option<Arc<T>> {
        self.get_by_id(&self.id_for(key))
    }

    pub fn get_by_id<T: Send + Sync + 'static>(&self, id: &str) -> Option<Arc<T>> {
        let value = self.inner.entries.get(id)?.value().clone();
        value.downcast::<T>().ok()
    }

    /// Store a new value and notify subscribers. Returns the stored reference.
    pub fn set<T: Send + Sync + 'static>(&self, key: &[Value], value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.set_shared(key, value.clone());
        value
    }

    /// Store an existing reference as-is.
    pub fn set_shared<T: Send + Sync + 'static>(&self, key: &[Value], value: Arc<T>) {
        let id = self.id_for(key);
        self.inner.entries.insert(id.clone(), value);
        trace!("cache set {id}");
        let _ = self.inner.events.send(CacheEvent::Updated { id });
    }

    pub fn remove(&self, key: &[Value]) -> bool {
        let id = self.id_for(key);
        let removed = self.inner.entries.remove(&id).is_some();
        if removed {
            let _ = self.inner.events.send(CacheEvent::Removed { id });
        }
        removed
    }

    pub fn contains(&self, key: &[Value]) -> bool {
        self.inner.entries.contains_key(&self.id_for(key))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Change notifications for every key in this cache.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(QueryKeyCodec::default(), 256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_returns_same_reference() {
        let cache = QueryCache::default();
        let key = vec![json!("battery")];

        let stored = cache.set(&key, 42u8);
        let read = cache.get::<u8>(&key).unwrap();
        assert!(Arc::ptr_eq(&stored, &read));
    }

    #[test]
    fn test_wrong_type_is_absent() {
        let cache = QueryCache::default();
        let key = vec![json!("battery")];
        cache.set(&key, String::from("full"));

        assert!(cache.get::<u8>(&key).is_none());
        assert!(cache.contains(&key));
    }

    #[test]
    fn test_events_on_set_and_remove() {
        let cache = QueryCache::default();
        let mut rx = cache.subscribe();
        let key = vec![json!("media"), json!({"player": "spotify"})];
        let id = cache.id_for(&key);

        cache.set(&key, 1u32);
        assert!(cache.remove(&key));
        assert!(!cache.remove(&key));

        assert_eq!(rx.try_recv().unwrap(), CacheEvent::Updated { id: id.clone() });
        assert_eq!(rx.try_recv().unwrap(), CacheEvent::Removed { id });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ids_use_codec() {
        let cache = QueryCache::new(QueryKeyCodec::new(crate::codec::KeyEncoding::Canonical), 256);
        cache.set(&[json!("weather"), json!({"units": "c", "city": "Oslo"})], 1u8);
        cache.set(&[json!("battery")], 2u8);

        assert_eq!(
            cache.ids(),
            vec![
                r#"query-["battery"]"#.to_string(),
                r#"query-["weather",{"city":"Oslo","units":"c"}]"#.to_string(),
            ]
        );
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = QueryCache::default();
        let other = cache.clone();
        cache.set(&[json!("battery")], 5u8);
        assert_eq!(*other.get::<u8>(&[json!("battery")]).unwrap(), 5);
    }
}

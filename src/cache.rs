//! TTL key-value cache used for object and listing lookups.
//!
//! Values are stored as JSON so any serializable model can be cached behind
//! the same trait object.

use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

/// Generic string-keyed cache with per-entry expiry.
#[async_trait]
pub trait TtlCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Option<Value>;

    async fn set(&self, key: &str, value: Value, ttl: Duration);

    async fn delete(&self, key: &str);
}

/// Typed read on top of [`TtlCache::get`]. Entries that no longer decode are treated as misses.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn TtlCache, key: &str) -> Option<T> {
    let value = cache.get(key).await?;
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            debug!("dropping undecodable cache entry {}: {}", key, err);
            cache.delete(key).await;
            None
        }
    }
}

/// Typed write on top of [`TtlCache::set`].
pub async fn set_json<T: Serialize>(cache: &dyn TtlCache, key: &str, value: &T, ttl: Duration) {
    match serde_json::to_value(value) {
        Ok(encoded) => cache.set(key, encoded, ttl).await,
        Err(err) => debug!("skipping cache write for {}: {}", key, err),
    }
}

/// In-process cache. Expired entries are dropped on read and swept on every
/// write, so keys that are never read again do not pile up.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, (Value, DateTime<Utc>)>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }
}

#[async_trait]
impl TtlCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        if entries.len() < before {
            debug!("swept {} expired cache entries", before - entries.len());
        }
        entries.insert(key.to_string(), (value, now + ttl));
    }

    async fn delete(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ManualClock;
    use serde_json::json;

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::default());
        let cache = MemoryCache::new(clock.clone());

        cache.set("k", json!({"a": 1}), Duration::seconds(300)).await;
        clock.advance(Duration::seconds(299));
        assert_eq!(cache.get("k").await, Some(json!({"a": 1})));

        clock.advance(Duration::seconds(1));
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_unread_expired_entries_are_swept_on_write() {
        let clock = Arc::new(ManualClock::default());
        let cache = MemoryCache::new(clock.clone());

        for i in 0..50 {
            cache.set(&format!("listing:{i}"), json!(i), Duration::seconds(300)).await;
        }
        cache.set("long-lived", json!("keep"), Duration::hours(48)).await;
        assert_eq!(cache.entries.lock().await.len(), 51);

        clock.advance(Duration::seconds(301));
        cache.set("fresh", json!(true), Duration::seconds(300)).await;

        let entries = cache.entries.lock().await;
        assert_eq!(entries.len(), 2);
        assert!(entries.contains_key("long-lived"));
        assert!(entries.contains_key("fresh"));
    }

    #[tokio::test]
    async fn test_delete_and_typed_helpers() {
        let cache = MemoryCache::new(Arc::new(ManualClock::default()));
        set_json(&cache, "numbers", &vec![1, 2, 3], Duration::seconds(60)).await;
        assert_eq!(get_json::<Vec<i32>>(&cache, "numbers").await, Some(vec![1, 2, 3]));

        assert_eq!(get_json::<String>(&cache, "numbers").await, None);
        assert_eq!(cache.get("numbers").await, None);

        cache.set("gone", json!(true), Duration::seconds(60)).await;
        cache.delete("gone").await;
        assert_eq!(cache.get("gone").await, None);
    }
}

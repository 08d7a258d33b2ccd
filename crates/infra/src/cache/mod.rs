//! Key/value cache backends and the ticket listing cache built on them.

pub mod listing;
#[cfg(feature = "redis")]
pub mod redis;

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

pub use listing::{CACHE_ENABLED_KEY, LISTING_GENERATION_KEY, LISTING_PREFIX, ListingCache};
#[cfg(feature = "redis")]
pub use self::redis::RedisCacheBackend;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),
    #[error("cache command error: {0}")]
    Command(String),
    #[error("cache serialization error: {0}")]
    Serialization(String),
}

/// Minimal string key/value store. No TTLs; entries live until deleted.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;

    /// Atomically add one to the integer at `key` (absent counts as 0).
    async fn incr(&self, key: &str) -> Result<u64, CacheError>;

    /// Delete every key starting with `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let current = match entries.get(key) {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| CacheError::Serialization(format!("{key} is not a counter: {e}")))?,
            None => 0,
        };
        let next = current + 1;
        entries.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let doomed: Vec<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_prefix_only_touches_matching_keys() {
        let cache = InMemoryCacheBackend::new();
        cache.set("tickets:page=1:limit=10", "a").await.unwrap();
        cache.set("tickets:page=2:limit=10", "b").await.unwrap();
        cache.set("tickets:pagex", "c").await.unwrap();
        cache.set("cache_enabled", "true").await.unwrap();

        assert_eq!(cache.delete_prefix("tickets:page=").await.unwrap(), 2);
        assert_eq!(cache.get("tickets:page=1:limit=10").await.unwrap(), None);
        assert_eq!(cache.get("tickets:pagex").await.unwrap().as_deref(), Some("c"));
        assert_eq!(cache.get("cache_enabled").await.unwrap().as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn incr_counts_from_zero_and_rejects_non_counters() {
        let cache = InMemoryCacheBackend::new();
        assert_eq!(cache.incr("n").await.unwrap(), 1);
        assert_eq!(cache.incr("n").await.unwrap(), 2);
        assert_eq!(cache.get("n").await.unwrap().as_deref(), Some("2"));

        cache.set("word", "abc").await.unwrap();
        assert!(matches!(cache.incr("word").await, Err(CacheError::Serialization(_))));
    }
}

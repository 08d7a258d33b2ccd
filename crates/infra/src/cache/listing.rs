//! Feature-gated read-through cache for ticket listings.
//!
//! The on/off flag is persisted in the backend itself, so every process
//! sharing the backend agrees on it. Toggling always clears the listings:
//! a re-enabled cache starts cold and cannot serve pages computed before
//! writes that happened while it was off.
//!
//! Every invalidation also bumps a generation counter that is part of each
//! page key. A page computed under an older generation is never stored, and
//! if it slips in anyway its key is no longer read, so a read racing a
//! write cannot leave a pre-write page behind.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::store::{Pagination, TicketPage};

use super::{CacheBackend, CacheError};

pub const CACHE_ENABLED_KEY: &str = "cache_enabled";
pub const LISTING_PREFIX: &str = "tickets:page=";
/// Lives outside `LISTING_PREFIX` so prefix deletes keep it.
pub const LISTING_GENERATION_KEY: &str = "tickets:generation";

pub fn listing_key(page: Pagination, generation: u64) -> String {
    format!(
        "{LISTING_PREFIX}{}:limit={}:gen={generation}",
        page.page, page.limit
    )
}

#[derive(Clone)]
pub struct ListingCache {
    backend: Arc<dyn CacheBackend>,
}

impl ListingCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Absent flag means disabled.
    pub async fn is_enabled(&self) -> Result<bool, CacheError> {
        Ok(self.backend.get(CACHE_ENABLED_KEY).await?.as_deref() == Some("true"))
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), CacheError> {
        self.backend
            .set(CACHE_ENABLED_KEY, if enabled { "true" } else { "false" })
            .await?;
        self.backend.incr(LISTING_GENERATION_KEY).await?;
        let removed = self.backend.delete_prefix(LISTING_PREFIX).await?;
        debug!(enabled, removed, "listing cache toggled");
        Ok(())
    }

    /// Serve `page` from cache when enabled, otherwise (or on miss) compute it.
    ///
    /// Backend failures never fail the read; the page is computed fresh.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        page: Pagination,
        compute: F,
    ) -> Result<TicketPage, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TicketPage, E>>,
    {
        let enabled = match self.is_enabled().await {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!(error = %e, "cache flag unreadable, bypassing cache");
                false
            }
        };
        if !enabled {
            return compute().await;
        }

        let generation = match self.generation().await {
            Ok(generation) => generation,
            Err(e) => {
                warn!(error = %e, "listing generation unreadable, bypassing cache");
                return compute().await;
            }
        };
        let key = listing_key(page, generation);
        match self.backend.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<TicketPage>(&raw) {
                Ok(cached) => {
                    debug!(key = %key, "listing cache hit");
                    return Ok(cached);
                }
                Err(e) => warn!(key = %key, error = %e, "discarding undecodable cache entry"),
            },
            Ok(None) => debug!(key = %key, "listing cache miss"),
            Err(e) => warn!(key = %key, error = %e, "cache read failed"),
        }

        let fresh = compute().await?;
        match self.generation().await {
            Ok(current) if current == generation => {}
            Ok(current) => {
                debug!(key = %key, current, "listings invalidated during compute, not caching");
                return Ok(fresh);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "listing generation unreadable, not caching");
                return Ok(fresh);
            }
        }
        match serde_json::to_string(&fresh) {
            Ok(raw) => {
                if let Err(e) = self.backend.set(&key, &raw).await {
                    warn!(key = %key, error = %e, "cache write failed");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "listing not serializable"),
        }
        Ok(fresh)
    }

    async fn generation(&self) -> Result<u64, CacheError> {
        match self.backend.get(LISTING_GENERATION_KEY).await? {
            None => Ok(0),
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                CacheError::Serialization(format!("bad listing generation `{raw}`: {e}"))
            }),
        }
    }

    /// Drop every cached listing page. Failures are logged, not returned.
    pub async fn invalidate_listings(&self) -> u64 {
        if let Err(e) = self.backend.incr(LISTING_GENERATION_KEY).await {
            warn!(error = %e, "listing generation bump failed");
        }
        match self.backend.delete_prefix(LISTING_PREFIX).await {
            Ok(removed) => {
                debug!(removed, "listing cache invalidated");
                removed
            }
            Err(e) => {
                warn!(error = %e, "listing cache invalidation failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::cache::InMemoryCacheBackend;

    fn page(total: u64) -> TicketPage {
        TicketPage {
            tickets: vec![],
            page: 1,
            limit: 10,
            total,
        }
    }

    async fn read(cache: &ListingCache, calls: &AtomicU32, total: u64) -> TicketPage {
        cache
            .get_or_compute(Pagination::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::convert::Infallible>(page(total))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn disabled_cache_always_computes() {
        let backend = InMemoryCacheBackend::arc();
        let cache = ListingCache::new(backend.clone());
        let calls = AtomicU32::new(0);

        assert!(!cache.is_enabled().await.unwrap());
        read(&cache, &calls, 1).await;
        read(&cache, &calls, 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(backend.len(), 0);
    }

    #[tokio::test]
    async fn enabled_cache_hits_until_invalidated() {
        let cache = ListingCache::new(InMemoryCacheBackend::arc());
        let calls = AtomicU32::new(0);
        cache.set_enabled(true).await.unwrap();

        assert_eq!(read(&cache, &calls, 1).await.total, 1);
        assert_eq!(read(&cache, &calls, 2).await.total, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.invalidate_listings().await, 1);
        assert_eq!(read(&cache, &calls, 2).await.total, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn toggling_starts_cold() {
        let cache = ListingCache::new(InMemoryCacheBackend::arc());
        let calls = AtomicU32::new(0);
        cache.set_enabled(true).await.unwrap();
        read(&cache, &calls, 1).await;

        cache.set_enabled(false).await.unwrap();
        cache.set_enabled(true).await.unwrap();
        assert_eq!(read(&cache, &calls, 5).await.total, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn page_computed_across_an_invalidation_is_not_served() {
        let cache = ListingCache::new(InMemoryCacheBackend::arc());
        cache.set_enabled(true).await.unwrap();

        let racing = cache
            .get_or_compute(Pagination::default(), || async {
                cache.invalidate_listings().await;
                Ok::<_, std::convert::Infallible>(page(1))
            })
            .await
            .unwrap();
        assert_eq!(racing.total, 1);

        let calls = AtomicU32::new(0);
        assert_eq!(read(&cache, &calls, 2).await.total, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn page_stored_under_an_old_generation_is_never_read() {
        let backend = InMemoryCacheBackend::arc();
        let cache = ListingCache::new(backend.clone());
        cache.set_enabled(true).await.unwrap();
        let stale_key = listing_key(Pagination::default(), 1);

        backend.incr(LISTING_GENERATION_KEY).await.unwrap();
        backend
            .set(&stale_key, &serde_json::to_string(&page(1)).unwrap())
            .await
            .unwrap();

        let calls = AtomicU32::new(0);
        assert_eq!(read(&cache, &calls, 2).await.total, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct Broken;

    #[async_trait]
    impl CacheBackend for Broken {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Connection("refused".into()))
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<(), CacheError> {
            Err(CacheError::Connection("refused".into()))
        }
        async fn incr(&self, _key: &str) -> Result<u64, CacheError> {
            Err(CacheError::Connection("refused".into()))
        }
        async fn delete_prefix(&self, _prefix: &str) -> Result<u64, CacheError> {
            Err(CacheError::Connection("refused".into()))
        }
    }

    #[tokio::test]
    async fn backend_failure_never_fails_reads() {
        let cache = ListingCache::new(Arc::new(Broken));
        let calls = AtomicU32::new(0);
        assert_eq!(read(&cache, &calls, 3).await.total, 3);
        assert_eq!(cache.invalidate_listings().await, 0);
    }

    #[test]
    fn keys_include_page_limit_and_generation() {
        assert_eq!(
            listing_key(Pagination::new(Some(2), Some(25)), 7),
            "tickets:page=2:limit=25:gen=7"
        );
    }
}

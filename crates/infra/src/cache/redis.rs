//! Redis cache backend.
//!
//! Prefix invalidation walks the keyspace with `SCAN MATCH prefix*` (never
//! `KEYS`) and deletes the matches in one `DEL`.

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;
use tracing::instrument;

use super::{CacheBackend, CacheError};

#[derive(Clone)]
pub struct RedisCacheBackend {
    client: Arc<redis::Client>,
    conn: Arc<OnceCell<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheBackend").finish_non_exhaustive()
    }
}

impl RedisCacheBackend {
    /// `redis_url` e.g. "redis://localhost:6379". Connects lazily.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            conn: Arc::new(OnceCell::new()),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| CacheError::Connection(e.to_string()))
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        conn.get(key)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        conn.set(key, value)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))
    }

    async fn incr(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;
        conn.incr(key, 1u64)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))
    }

    #[instrument(skip(self), err)]
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut scan_conn = self.connection().await?;
        let pattern = format!("{prefix}*");

        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter = scan_conn
                .scan_match::<_, String>(&pattern)
                .await
                .map_err(|e| CacheError::Command(e.to_string()))?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection().await?;
        let removed: u64 = conn
            .del(&keys)
            .await
            .map_err(|e| CacheError::Command(e.to_string()))?;
        Ok(removed)
    }
}

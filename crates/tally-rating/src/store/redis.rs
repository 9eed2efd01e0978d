//! Redis state cache
//!
//! Rated states are cached as JSON under `<prefix>:<state key>` with a TTL.

use super::StateCache;
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tally_common::{RatedUsageState, Result, StateKey, TallyError};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// Redis-backed state cache
pub struct RedisStateCache {
    client: Client,
    connection: Arc<RwLock<Option<MultiplexedConnection>>>,
    prefix: String,
    ttl: Duration,
}

impl RedisStateCache {
    /// Create a cache; the connection is opened on first use
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| TallyError::Config(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
            prefix: "tally:rating".to_string(),
            ttl: Duration::from_secs(3600),
        })
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn redis_key(&self, key: &StateKey) -> String {
        format!("{}:{}", self.prefix, key)
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection> {
        let guard = self.connection.read().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        drop(guard);

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TallyError::Storage(format!("Failed to connect to Redis: {}", e)))?;

        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Drop the shared connection so the next call reconnects
    async fn reset_connection(&self, error: &redis::RedisError) {
        if error.is_connection_dropped() || error.is_io_error() {
            *self.connection.write().await = None;
        }
    }
}

#[async_trait]
impl StateCache for RedisStateCache {
    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &StateKey) -> Result<Option<RatedUsageState>> {
        let redis_key = self.redis_key(key);
        let mut conn = self.get_connection().await?;

        let cached: Option<String> = match conn.get(&redis_key).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Cache get error: {}", e);
                self.reset_connection(&e).await;
                return Err(TallyError::Storage(format!("Redis get failed: {}", e)));
            }
        };

        match cached {
            Some(json) => {
                debug!(key = %redis_key, "Cache hit");
                let state = serde_json::from_str(&json).map_err(|e| {
                    TallyError::Serialization(format!("Failed to decode cached state: {}", e))
                })?;
                Ok(Some(state))
            }
            None => {
                debug!(key = %redis_key, "Cache miss");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, state), fields(key = %key))]
    async fn put(&self, key: &StateKey, state: &RatedUsageState) -> Result<()> {
        let redis_key = self.redis_key(key);
        let json = serde_json::to_string(state)?;
        let mut conn = self.get_connection().await?;

        if let Err(e) = conn
            .set_ex::<_, _, ()>(&redis_key, json, self.ttl.as_secs().max(1))
            .await
        {
            warn!("Cache set error: {}", e);
            self.reset_connection(&e).await;
            return Err(TallyError::Storage(format!("Redis set failed: {}", e)));
        }

        debug!(key = %redis_key, ttl_secs = self.ttl.as_secs(), "Cached rated state");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn remove(&self, key: &StateKey) -> Result<()> {
        let redis_key = self.redis_key(key);
        let mut conn = self.get_connection().await?;

        if let Err(e) = conn.del::<_, ()>(&redis_key).await {
            self.reset_connection(&e).await;
            return Err(TallyError::Storage(format!("Redis DEL failed: {}", e)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_common::AggregatedUsageDoc;

    #[test]
    fn test_key_layout() {
        let cache = RedisStateCache::new("redis://localhost:6379")
            .unwrap()
            .with_prefix("test");
        let key = StateKey::new("org1", 0);
        assert_eq!(cache.redis_key(&key), "test:k/org1/t/0000000000000000");
    }

    #[tokio::test]
    #[ignore]
    async fn test_round_trip_against_live_redis() {
        let url = std::env::var("TALLY_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let cache = RedisStateCache::new(&url)
            .unwrap()
            .with_prefix("tally-test")
            .with_ttl(Duration::from_secs(30));
        let key = StateKey::new("org-redis-test", 0);
        let state = RatedUsageState::seed(&AggregatedUsageDoc::new("org-redis-test", 0, 1));

        cache.put(&key, &state).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(state));
        cache.remove(&key).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
    }
}

//! Shared remote tier over Redis (behind the `redis` feature).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::info;

use super::tier::{CacheError, CacheTier};

/// Connection timeout in seconds.
const REDIS_CONNECTION_TIMEOUT_SECS: u64 = 5;

/// Redis-backed tier using a multiplexed, auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisTier {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTier").finish_non_exhaustive()
    }
}

impl RedisTier {
    /// Connects to `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = Client::open(redis_url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let conn = tokio::time::timeout(
            Duration::from_secs(REDIS_CONNECTION_TIMEOUT_SECS),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| CacheError::Unavailable("Redis connection timeout".to_string()))?
        .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        info!("Redis cache tier connected");
        Ok(Self { conn })
    }
}

fn command_error(e: &redis::RedisError) -> CacheError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
        CacheError::Unavailable(e.to_string())
    } else {
        CacheError::Command(e.to_string())
    }
}

#[async_trait]
impl CacheTier for RedisTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| command_error(&e))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| command_error(&e))
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(|e| command_error(&e))
    }
}

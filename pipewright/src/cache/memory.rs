//! In-process tier backed by moka.

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::tier::{CacheError, CacheTier};

/// Default entry capacity.
pub const DEFAULT_CAPACITY: u64 = 10_000;

/// Default upper bound on local entry lifetime.
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct Entry {
    bytes: Arc<[u8]>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded in-process tier. Entry lifetime is `min(ttl, max_ttl)`.
#[derive(Clone)]
pub struct MemoryTier {
    cache: Cache<String, Entry>,
    max_ttl: Duration,
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("entries", &self.cache.entry_count())
            .field("max_ttl", &self.max_ttl)
            .finish()
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_TTL)
    }
}

impl MemoryTier {
    /// Creates a tier holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: u64, max_ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache, max_ttl }
    }

    /// Approximate number of live entries.
    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.cache.get(key).await.map(|e| e.bytes.to_vec()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            bytes: Arc::from(value),
            ttl: ttl.min(self.max_ttl),
        };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_del() {
        let tier = MemoryTier::default();
        tier.set("k", b"v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(tier.get("k").await.unwrap(), Some(b"v".to_vec()));
        tier.del("k").await.unwrap();
        assert_eq!(tier.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let tier = MemoryTier::default();
        tier.set("k", b"v", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(tier.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_lifetime_is_capped() {
        let tier = MemoryTier::new(10, Duration::from_millis(20));
        tier.set("k", b"v", Duration::from_secs(3600)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(tier.get("k").await.unwrap(), None);
    }
}

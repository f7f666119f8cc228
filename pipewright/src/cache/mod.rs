//! Layered cache.
//!
//! [`LayeredCache`] probes its tiers in priority order (fast local tier
//! first). A hit in a lower tier is promoted into every higher tier before
//! returning. Writes go to every tier. Tier failures are counted and logged
//! but never returned: a cache that is down only costs performance.

mod key;
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod tier;

pub use key::{canonical_json, hash_value, Structured, ToCacheKey, STRUCTURED_PREFIX};
pub use memory::MemoryTier;
#[cfg(feature = "redis")]
pub use self::redis::RedisTier;
#[cfg(test)]
pub use tier::MockCacheTier;
pub use tier::{CacheError, CacheTier};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;

/// Counters describing cache behaviour since construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Hits per tier name.
    pub hits: BTreeMap<String, u64>,
    /// Lookups that missed every tier.
    pub misses: u64,
    /// Values copied into higher tiers after a lower-tier hit.
    pub promotions: u64,
    /// Calls to `set` (including those made by `wrap`).
    pub writes: u64,
    /// Tier operations that failed.
    pub errors: u64,
}

impl CacheStats {
    /// Total hits across tiers.
    #[must_use]
    pub fn total_hits(&self) -> u64 {
        self.hits.values().sum()
    }
}

struct TierSlot {
    tier: Arc<dyn CacheTier>,
    degraded: AtomicBool,
}

/// Multi-tier cache over JSON-serialised values.
pub struct LayeredCache {
    namespace: String,
    default_ttl: Duration,
    tiers: Vec<TierSlot>,
    stats: Mutex<CacheStats>,
}

impl std::fmt::Debug for LayeredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredCache")
            .field("namespace", &self.namespace)
            .field("tiers", &self.tier_names())
            .finish_non_exhaustive()
    }
}

impl LayeredCache {
    /// Creates a cache with no tiers.
    #[must_use]
    pub fn new(namespace: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            namespace: namespace.into(),
            default_ttl,
            tiers: Vec::new(),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Appends a tier with lower priority than those already added.
    #[must_use]
    pub fn with_tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.tiers.push(TierSlot {
            tier,
            degraded: AtomicBool::new(false),
        });
        self
    }

    /// A cache with only the in-process tier.
    #[must_use]
    pub fn memory_only(config: &CacheConfig) -> Self {
        Self::new(config.namespace.clone(), config.default_ttl()).with_tier(Arc::new(
            MemoryTier::new(config.local_capacity, config.local_max_ttl()),
        ))
    }

    /// Builds the cache described by `config`. An unreachable remote store
    /// leaves a local-only cache.
    pub async fn from_config(config: &CacheConfig) -> Self {
        let cache = Self::memory_only(config);
        let Some(url) = config.redis_url.as_deref() else {
            return cache;
        };
        cache.with_remote(url).await
    }

    #[cfg(feature = "redis")]
    async fn with_remote(self, url: &str) -> Self {
        match RedisTier::connect(url).await {
            Ok(tier) => self.with_tier(Arc::new(tier)),
            Err(e) => {
                warn!(error = %e, "Remote cache unavailable; using local cache only");
                self
            }
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn with_remote(self, _url: &str) -> Self {
        warn!("Remote cache configured but the `redis` feature is disabled; using local cache only");
        self
    }

    /// Names of the configured tiers, highest priority first.
    #[must_use]
    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|s| s.tier.name()).collect()
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    /// The namespaced key for `key`.
    pub fn full_key<K: ToCacheKey + ?Sized>(&self, key: &K) -> String {
        format!("{}:{}", self.namespace, key.to_cache_key())
    }

    /// Looks up a value. Undecodable entries count as misses.
    pub async fn get<T, K>(&self, key: &K) -> Option<T>
    where
        T: DeserializeOwned,
        K: ToCacheKey + ?Sized,
    {
        let full = self.full_key(key);

        for (idx, slot) in self.tiers.iter().enumerate() {
            let bytes = match slot.tier.get(&full).await {
                Ok(Some(bytes)) => {
                    self.tier_ok(slot);
                    bytes
                }
                Ok(None) => {
                    self.tier_ok(slot);
                    continue;
                }
                Err(e) => {
                    self.tier_failed(slot, &e);
                    continue;
                }
            };

            match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    *self
                        .stats
                        .lock()
                        .hits
                        .entry(slot.tier.name().to_string())
                        .or_default() += 1;
                    if idx > 0 {
                        self.promote(&full, &bytes, &self.tiers[..idx]).await;
                    }
                    return Some(value);
                }
                Err(e) => {
                    debug!(key = %full, tier = slot.tier.name(), error = %e, "Ignoring undecodable cache entry");
                }
            }
        }

        self.stats.lock().misses += 1;
        None
    }

    async fn promote(&self, full: &str, bytes: &[u8], higher: &[TierSlot]) {
        for slot in higher {
            match slot.tier.set(full, bytes, self.default_ttl).await {
                Ok(()) => {
                    self.tier_ok(slot);
                    self.stats.lock().promotions += 1;
                }
                Err(e) => self.tier_failed(slot, &e),
            }
        }
    }

    /// Writes a value to every tier. `ttl` defaults to the configured TTL.
    pub async fn set<T, K>(&self, key: &K, value: &T, ttl: Option<Duration>)
    where
        T: Serialize + ?Sized,
        K: ToCacheKey + ?Sized,
    {
        let full = self.full_key(key);
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %full, error = %e, "Value is not serialisable; not cached");
                return;
            }
        };
        self.stats.lock().writes += 1;
        let ttl = ttl.unwrap_or(self.default_ttl);

        for slot in &self.tiers {
            match slot.tier.set(&full, &bytes, ttl).await {
                Ok(()) => self.tier_ok(slot),
                Err(e) => self.tier_failed(slot, &e),
            }
        }
    }

    /// Removes a value from every tier.
    pub async fn del<K: ToCacheKey + ?Sized>(&self, key: &K) {
        let full = self.full_key(key);
        for slot in &self.tiers {
            match slot.tier.del(&full).await {
                Ok(()) => self.tier_ok(slot),
                Err(e) => self.tier_failed(slot, &e),
            }
        }
    }

    /// Returns the cached value, or runs `producer` and caches its result.
    ///
    /// `producer` runs at most once per call. A result that serialises to
    /// `null` is returned but not cached; a producer error is returned
    /// unchanged and nothing is cached.
    pub async fn wrap<T, E, K, F, Fut>(&self, key: &K, ttl: Option<Duration>, producer: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        K: ToCacheKey + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.wrap_with_status(key, ttl, producer)
            .await
            .map(|(value, _)| value)
    }

    /// Like [`wrap`](Self::wrap) but also reports whether the value came
    /// from the cache.
    pub async fn wrap_with_status<T, E, K, F, Fut>(
        &self,
        key: &K,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<(T, bool), E>
    where
        T: Serialize + DeserializeOwned,
        K: ToCacheKey + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get::<T, K>(key).await {
            return Ok((hit, true));
        }

        let value = producer().await?;
        if matches!(serde_json::to_value(&value), Ok(Value::Null)) {
            debug!(key = %self.full_key(key), "Producer returned null; not cached");
        } else {
            self.set(key, &value, ttl).await;
        }
        Ok((value, false))
    }

    fn tier_ok(&self, slot: &TierSlot) {
        if slot.degraded.swap(false, Ordering::SeqCst) {
            info!(tier = slot.tier.name(), "Cache tier recovered");
        }
    }

    fn tier_failed(&self, slot: &TierSlot, error: &CacheError) {
        self.stats.lock().errors += 1;
        if slot.degraded.swap(true, Ordering::SeqCst) {
            debug!(tier = slot.tier.name(), error = %error, "Cache tier still failing");
        } else {
            warn!(tier = slot.tier.name(), error = %error, "Cache tier failing; continuing without it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn two_tier() -> (LayeredCache, Arc<MemoryTier>, Arc<MemoryTier>) {
        let local = Arc::new(MemoryTier::default());
        let remote = Arc::new(MemoryTier::default());
        let cache = LayeredCache::new("test", Duration::from_secs(60))
            .with_tier(local.clone())
            .with_tier(remote.clone());
        (cache, local, remote)
    }

    fn failing_remote() -> MockCacheTier {
        let mut remote = MockCacheTier::new();
        remote.expect_name().return_const("remote");
        remote
            .expect_get()
            .returning(|_| Err(CacheError::Unavailable("connection refused".into())));
        remote
            .expect_set()
            .returning(|_, _, _| Err(CacheError::Unavailable("connection refused".into())));
        remote
            .expect_del()
            .returning(|_| Err(CacheError::Unavailable("connection refused".into())));
        remote
    }

    #[tokio::test]
    async fn test_set_get_del_round_trip() {
        let (cache, local, remote) = two_tier();
        cache.set("k", &json!({"n": 1}), None).await;
        assert_eq!(cache.get::<Value, _>("k").await, Some(json!({"n": 1})));
        assert!(local.get("test:k").await.unwrap().is_some());
        assert!(remote.get("test:k").await.unwrap().is_some());

        cache.del("k").await;
        assert_eq!(cache.get::<Value, _>("k").await, None);
        let stats = cache.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_lower_tier_hit_is_promoted() {
        let (cache, local, remote) = two_tier();
        remote.set("test:k", b"42", Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.get::<u32, _>("k").await, Some(42));
        assert_eq!(local.get("test:k").await.unwrap(), Some(b"42".to_vec()));

        assert_eq!(cache.get::<u32, _>("k").await, Some(42));
        let stats = cache.stats();
        assert_eq!(stats.hits.get("memory"), Some(&2));
        assert_eq!(stats.promotions, 1);
    }

    #[tokio::test]
    async fn test_failing_remote_degrades_to_local() {
        let local = Arc::new(MemoryTier::default());
        let cache = LayeredCache::new("ns", Duration::from_secs(60))
            .with_tier(local.clone())
            .with_tier(Arc::new(failing_remote()));

        cache.set("k", &"v", None).await;
        assert_eq!(cache.get::<String, _>("k").await, Some("v".to_string()));
        assert_eq!(cache.get::<String, _>("missing").await, None);
        cache.del("k").await;

        let stats = cache.stats();
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_wrap_calls_producer_once() {
        let (cache, _, _) = two_tier();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let value: Result<String, String> = cache
                .wrap("expensive", None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("result".to_string())
                })
                .await;
            assert_eq!(value.unwrap(), "result");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrap_does_not_cache_null_or_errors() {
        let (cache, _, _) = two_tier();
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let out: Result<Option<u32>, String> = cache
                .wrap("nothing", None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await;
            assert_eq!(out.unwrap(), None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let err: Result<u32, &str> = cache.wrap("boom", None, || async { Err("boom") }).await;
        assert_eq!(err, Err("boom"));
        assert_eq!(cache.get::<u32, _>("boom").await, None);
    }

    #[tokio::test]
    async fn test_wrap_reports_hits() {
        let (cache, _, _) = two_tier();
        let (_, hit) = cache
            .wrap_with_status::<_, (), _, _, _>("k", None, || async { Ok(1u8) })
            .await
            .unwrap();
        assert!(!hit);
        let (_, hit) = cache
            .wrap_with_status::<_, (), _, _, _>("k", None, || async { Ok(2u8) })
            .await
            .unwrap();
        assert!(hit);
    }

    #[tokio::test]
    async fn test_structured_keys() {
        let (cache, _, _) = two_tier();
        let key = json!({"stage": "write", "config": {"a": 1, "b": 2}});
        cache.set(&key, &"cached", None).await;
        let same = json!({"config": {"b": 2, "a": 1}, "stage": "write"});
        assert_eq!(cache.get::<String, _>(&same).await, Some("cached".to_string()));
        assert!(cache.full_key(&key).starts_with("test:obj:"));
    }

    #[tokio::test]
    async fn test_memory_only_from_config() {
        let cache = LayeredCache::from_config(&CacheConfig::default()).await;
        assert_eq!(cache.tier_names(), vec!["memory"]);
    }
}

//! The cache tier seam.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by an individual tier. [`LayeredCache`](super::LayeredCache)
/// logs and absorbs them; they never reach stage callers.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The backing store could not be reached.
    #[error("cache tier unavailable: {0}")]
    Unavailable(String),

    /// The backing store rejected the command.
    #[error("cache command failed: {0}")]
    Command(String),
}

/// One layer of the layered cache, storing opaque bytes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Short tier name used in stats and logs.
    fn name(&self) -> &'static str;

    /// Fetches a value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores a value with a time-to-live.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Removes a value.
    async fn del(&self, key: &str) -> Result<(), CacheError>;
}

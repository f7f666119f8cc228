//! Backoff policies for retry loops.
//!
//! Used by lock acquisition (between `create_new` attempts) and by the
//! executor (between stage attempts). Both need the same shape: a base
//! delay grown by a strategy, capped, then jittered so that competing
//! processes do not retry in lockstep.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    #[default]
    Equal,
}

/// A complete backoff policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Growth strategy.
    pub strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            strategy: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Equal,
        }
    }
}

impl BackoffPolicy {
    /// Creates an exponential policy with the given bounds.
    #[must_use]
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base_delay_ms: duration_ms(base),
            max_delay_ms: duration_ms(max),
            ..Self::default()
        }
    }

    /// Sets the growth strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0 = first retry), without jitter.
    #[must_use]
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms;
        let ms = match self.strategy {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(attempt))
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1),
            BackoffStrategy::Constant => base,
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Delay before retry number `attempt`, with jitter applied.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = duration_ms(self.raw_delay(attempt));
        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Runs `operation` up to `retries + 1` times, sleeping per `policy`
/// between failures. Returns the last error with the number of attempts.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    retries: u32,
    mut operation: F,
) -> Result<(T, u32), (E, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok((value, attempt + 1)),
            Err(e) if attempt < retries => {
                let delay = policy.delay(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = duration_ms(delay),
                    error = %e,
                    "Retrying after error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err((e, attempt + 1)),
        }
    }
}

//! Per-source token bucket.
//!
//! Buckets start full and refill continuously at `refill_tokens` per
//! `refill_interval`, capped at `capacity`. Refill is evaluated lazily on
//! every acquire. Each source owns its own bucket, so sources never contend
//! with each other. State is in-memory only and resets on restart.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::EtlError;
use crate::ingest::types::SourceId;

/// What `acquire` does when the bucket is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Suspend until a token is available or `max_wait` would be exceeded.
    #[default]
    Block,
    /// Fail immediately with `RateLimitExceeded`.
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub capacity: u32,
    pub refill_tokens: u32,
    pub refill_interval_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default)]
    pub mode: WaitMode,
}

fn default_max_wait_ms() -> u64 {
    120_000
}

impl RateLimitPolicy {
    /// `n` calls per minute with a burst of `n`.
    pub fn per_minute(n: u32) -> Self {
        Self {
            capacity: n,
            refill_tokens: n,
            refill_interval_ms: 60_000,
            max_wait_ms: default_max_wait_ms(),
            mode: WaitMode::Block,
        }
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    fn tokens_per_sec(&self) -> f64 {
        let secs = self.refill_interval().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        f64::from(self.refill_tokens) / secs
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    source: SourceId,
    policy: RateLimitPolicy,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(source: SourceId, policy: RateLimitPolicy) -> Self {
        let tokens = f64::from(policy.capacity);
        Self {
            source,
            policy,
            state: Mutex::new(BucketState {
                tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        let cap = f64::from(self.policy.capacity);
        state.tokens = (state.tokens + elapsed * self.policy.tokens_per_sec()).min(cap);
        state.last_refill = now;
    }

    /// Take a token if one is available, otherwise report how long until
    /// the next one.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }
        let rate = self.policy.tokens_per_sec();
        if rate <= 0.0 {
            return Err(self.policy.max_wait() + Duration::from_millis(1));
        }
        let missing = 1.0 - state.tokens;
        Err(Duration::from_secs_f64(missing / rate).max(Duration::from_millis(1)))
    }

    /// Tokens currently in the bucket (after a lazy refill).
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Grant a token, suspending the caller until one is refilled when the
    /// bucket is empty. Fails with `RateLimitExceeded` in fail-fast mode or
    /// once the total wait would pass `max_wait`.
    pub async fn acquire(&self) -> Result<(), EtlError> {
        let started = Instant::now();
        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            let waited = started.elapsed();
            if self.policy.mode == WaitMode::FailFast || waited + wait > self.policy.max_wait() {
                tracing::debug!(source = %self.source, ?waited, "rate limit exceeded");
                return Err(EtlError::RateLimitExceeded {
                    source_id: self.source,
                    waited,
                });
            }
            tracing::trace!(source = %self.source, ?wait, "waiting for rate limit token");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(capacity: u32, interval_ms: u64) -> RateLimitPolicy {
        RateLimitPolicy {
            capacity,
            refill_tokens: 1,
            refill_interval_ms: interval_ms,
            max_wait_ms: 60_000,
            mode: WaitMode::Block,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn starts_full_and_drains() {
        let bucket = TokenBucket::new(SourceId::CoinGecko, policy(3, 1_000));
        for _ in 0..3 {
            assert!(bucket.try_acquire().is_ok());
        }
        let wait = bucket.try_acquire().unwrap_err();
        assert!(wait <= Duration::from_millis(1_000));
        assert!(wait >= Duration::from_millis(999));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_capacity() {
        let bucket = TokenBucket::new(SourceId::CoinGecko, policy(2, 100));
        bucket.try_acquire().unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((bucket.available() - 2.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_does_not_wait() {
        let mut p = policy(1, 10_000);
        p.mode = WaitMode::FailFast;
        let bucket = TokenBucket::new(SourceId::CoinPaprika, p);
        bucket.acquire().await.unwrap();
        let err = bucket.acquire().await.unwrap_err();
        assert!(matches!(err, EtlError::RateLimitExceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_bounds_blocking() {
        let mut p = policy(1, 10_000);
        p.max_wait_ms = 500;
        let bucket = TokenBucket::new(SourceId::CoinPaprika, p);
        bucket.acquire().await.unwrap();
        let err = bucket.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            EtlError::RateLimitExceeded { source_id: SourceId::CoinPaprika, .. }
        ));
    }
}

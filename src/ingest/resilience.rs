//! Retry with exponential backoff, and a per-source circuit breaker.
//!
//! Backoff delays are a pure function of the attempt number and a jitter
//! draw, so tests inject a fixed [`Jitter`] and run on tokio's paused clock.
//! The breaker is driven by whole runs, not single calls:
//! `closed -> open` after N consecutive failed runs, `open -> half-open`
//! once the cool-down has elapsed (exactly one trial run is admitted),
//! then `half-open -> closed` on success or back to `open` on failure.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::EtlError;
use crate::ingest::types::SourceId;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN_SECS: u64 = 30 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Extra random fraction added on top of the exponential delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), given a jitter draw in `[0, 1)`.
    pub fn delay_for(&self, retry: u32, jitter: f64) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let exp = self.base_delay_ms.saturating_mul(1u64 << shift);
        let capped = exp.min(self.max_delay_ms);
        let factor = 1.0 + self.jitter_ratio.max(0.0) * jitter.clamp(0.0, 1.0);
        let base = Duration::from_millis(capped);
        // jitter past Duration's range falls back to the bare cap
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

/// Source of jitter draws in `[0, 1)`.
pub trait Jitter: Send + Sync {
    fn draw(&self) -> f64;
}

/// Seedable RNG-backed jitter.
#[derive(Debug)]
pub struct RandomJitter {
    rng: Mutex<StdRng>,
}

impl RandomJitter {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_os() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }
}

impl Jitter for RandomJitter {
    fn draw(&self) -> f64 {
        self.rng
            .lock()
            .expect("jitter rng mutex poisoned")
            .random_range(0.0..1.0)
    }
}

/// Always returns the same draw.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl Jitter for FixedJitter {
    fn draw(&self) -> f64 {
        self.0
    }
}

/// Retry bookkeeping for one logical call.
///
/// ```ignore
/// let mut retrier = Retrier::new(&policy, &jitter, source, "extract");
/// let out = loop {
///     match op().await {
///         Err(e) if retrier.should_retry(&e).await => continue,
///         other => break other,
///     }
/// };
/// ```
pub struct Retrier<'a> {
    policy: &'a RetryPolicy,
    jitter: &'a dyn Jitter,
    source: SourceId,
    operation: &'static str,
    attempt: u32,
}

impl<'a> Retrier<'a> {
    pub fn new(
        policy: &'a RetryPolicy,
        jitter: &'a dyn Jitter,
        source: SourceId,
        operation: &'static str,
    ) -> Self {
        Self {
            policy,
            jitter,
            source,
            operation,
            attempt: 1,
        }
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Sleep out the backoff and return `true` when `err` is transient and
    /// attempts remain; return `false` straight away otherwise.
    pub async fn should_retry(&mut self, err: &EtlError) -> bool {
        if !err.is_transient() {
            debug!(source = %self.source, op = self.operation, error = %err, "permanent error, not retrying");
            return false;
        }
        if self.attempt >= self.policy.max_attempts {
            warn!(
                source = %self.source,
                op = self.operation,
                attempts = self.attempt,
                error = %err,
                "retries exhausted"
            );
            return false;
        }
        let delay = self.policy.delay_for(self.attempt, self.jitter.draw());
        debug!(
            source = %self.source,
            op = self.operation,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient error, backing off"
        );
        metrics::counter!("etl_retries_total", "source" => self.source.as_str()).increment(1);
        tokio::time::sleep(delay).await;
        self.attempt += 1;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
        }
    }
}

impl BreakerPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { since: Instant },
    /// A single trial run has been admitted and has not reported back yet.
    HalfOpen,
}

/// Outcome of asking the breaker for permission to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The one trial run after a cool-down.
    Trial,
    Rejected { retry_in: Duration },
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    source: SourceId,
    policy: BreakerPolicy,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(source: SourceId, policy: BreakerPolicy) -> Self {
        Self {
            source,
            policy,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .expect("breaker mutex poisoned")
            .consecutive_failures
    }

    /// Ask to start a run. Moves `open -> half-open` when the cool-down has
    /// elapsed; every later call is rejected until the trial reports back.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::HalfOpen => Admission::Rejected {
                retry_in: Duration::ZERO,
            },
            BreakerState::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.policy.cooldown() {
                    inner.state = BreakerState::HalfOpen;
                    info!(source = %self.source, "circuit half-open, admitting trial run");
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_in: self.policy.cooldown() - elapsed,
                    }
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state != BreakerState::Closed {
            info!(source = %self.source, "circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
    }

    /// Count a failed run. Returns `true` if this call opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.policy.failure_threshold,
            BreakerState::Open { .. } => false,
        };
        if trip {
            inner.state = BreakerState::Open {
                since: Instant::now(),
            };
            warn!(
                source = %self.source,
                failures = inner.consecutive_failures,
                cooldown_secs = self.policy.cooldown_secs,
                "circuit opened"
            );
            metrics::counter!("etl_circuit_open_total", "source" => self.source.as_str())
                .increment(1);
        }
        trip
    }

    /// Give back a half-open admission without a verdict (e.g. the run was
    /// interrupted). The cool-down is considered elapsed, so the next admit
    /// is a trial again.
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state == BreakerState::HalfOpen {
            let since = Instant::now()
                .checked_sub(self.policy.cooldown())
                .unwrap_or_else(Instant::now);
            inner.state = BreakerState::Open { since };
        }
    }
}

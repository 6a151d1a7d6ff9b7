// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry executor, timeouts, rate limiting, bulkheads.
//!
//! - [`RetryPolicy`] + [`execute_with_retry`]: bounded retries with exponential
//!   backoff and jitter for transient failures
//! - [`with_timeout`]: deadline that surfaces as a retryable [`SyncError::Timeout`]
//! - [`RateLimiter`]: token bucket pacing offline-queue replay after reconnect
//! - [`Bulkhead`]: semaphore bounding concurrent cache warmup fetches
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> profile_sync_engine::Result<()> {
//! use profile_sync_engine::resilience::{execute_with_retry, RetryPolicy};
//! use profile_sync_engine::SyncError;
//!
//! let policy = RetryPolicy::default();
//! let value = execute_with_retry(&policy, "get_ownership", || async {
//!     Ok::<_, SyncError>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, SyncError};
use crate::metrics;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use rand::Rng;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Decides whether a failed attempt should be retried.
pub type RetryPredicate = fn(&SyncError) -> bool;

fn retry_by_kind(err: &SyncError) -> bool {
    err.is_retryable()
}

/// Retry behaviour for a single call. Immutable once built.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Ceiling for exponential backoff (jitter is added on top).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_multiplier: f64,

    /// Fraction of the computed delay added as uniform random jitter.
    pub jitter: f64,

    /// Classifies errors; `false` rethrows immediately.
    pub retry_predicate: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.1,
            retry_predicate: retry_by_kind,
        }
    }
}

impl RetryPolicy {
    /// More attempts with a longer ceiling, for user-initiated syncs.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: 0.0,
            retry_predicate: retry_by_kind,
        }
    }

    /// Replace the retry predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.retry_predicate = predicate;
        self
    }

    /// Replace the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Backoff before retrying after `attempt` (1-indexed) failed, without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.base_delay;
        }

        let multiplier = self.backoff_multiplier.powi((attempt - 1) as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    /// Backoff plus uniform jitter in `[0, jitter * delay]`.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        delay + Duration::from_secs_f64(extra)
    }

    /// Check whether `err` should be retried after `attempt` attempts.
    pub fn should_retry(&self, err: &SyncError, attempt: u32) -> bool {
        attempt < self.max_attempts && (self.retry_predicate)(err)
    }
}

/// Run `operation` until it succeeds, the predicate rejects the error, or the
/// attempt budget is spent. The final error is returned unchanged.
pub async fn execute_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if policy.should_retry(&e, attempt) => {
                let delay = policy.delay_with_jitter(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                metrics::record_retry_attempt(operation_name, e.kind().as_str());
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() && attempt >= policy.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempt,
                        error = %e,
                        "Retries exhausted"
                    );
                    metrics::record_retry_exhausted(operation_name);
                }
                return Err(e);
            }
        }
    }
}

/// Await `fut` for at most `duration`; elapsing becomes a retryable timeout.
pub async fn with_timeout<Fut, T>(operation_name: &str, duration: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::timeout(operation_name, duration)),
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket configuration: `refill_rate` tokens per second up to `burst_size`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 10 ops/sec with burst of 5.
    fn default() -> Self {
        Self {
            burst_size: 5,
            refill_rate: 10,
        }
    }
}

impl RateLimitConfig {
    /// No rate limiting (unlimited).
    pub fn unlimited() -> Self {
        Self {
            burst_size: u32::MAX,
            refill_rate: u32::MAX,
        }
    }
}

/// Token bucket rate limiter.
///
/// Spreads queue replay after a reconnect so every client coming back online
/// at once does not hammer the ownership source.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Acquire a permit, waiting until one is available. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: max {max_concurrent} concurrent operations")]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

/// Limits concurrent operations with a semaphore.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquire a permit, waiting if necessary. The slot frees when the permit drops.
    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, BulkheadFull> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }

    /// Returns `None` if the bulkhead is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.0,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(16));
        // Should cap at max_delay
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(5000), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.delay_with_jitter(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_always_failing_runs_max_attempts() {
        let policy = RetryPolicy::testing();
        let calls = AtomicU32::new(0);

        let result: Result<()> = execute_with_retry(&policy, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(SyncError::network("test", format!("failure {}", n))) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(SyncError::NetworkUnavailable { message, .. }) => assert_eq!(message, "failure 3"),
            other => panic!("expected final network error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_once_then_succeed() {
        let policy = RetryPolicy::testing();
        let calls = AtomicU32::new(0);

        let result = execute_with_retry(&policy, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(SyncError::server("test", "503"))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let policy = RetryPolicy::testing();
        let calls = AtomicU32::new(0);

        let result: Result<()> = execute_with_retry(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::UserRejected("declined".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(SyncError::UserRejected(_))));
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        fn never(_: &SyncError) -> bool {
            false
        }
        let policy = RetryPolicy::testing().with_predicate(never);
        let calls = AtomicU32::new(0);

        let _: Result<()> = execute_with_retry(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::network("test", "down")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_timeout_maps_to_timeout_error() {
        let result: Result<()> = with_timeout("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, SyncError::Timeout { timeout_ms: 10, .. }));
    }

    #[test]
    fn test_rate_limiter_try_acquire_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 5,
            refill_rate: 1,
        });

        for _ in 0..5 {
            assert!(limiter.try_acquire(), "should acquire within burst");
        }
        assert!(!limiter.try_acquire(), "should fail after burst exhausted");
    }

    #[test]
    fn test_bulkhead_try_acquire() {
        let bulkhead = Bulkhead::new(2);

        let p1 = bulkhead.try_acquire();
        let p2 = bulkhead.try_acquire();
        assert!(p1.is_some() && p2.is_some());
        assert!(bulkhead.try_acquire().is_none());

        drop(p1);
        assert_eq!(bulkhead.available(), 1);
    }

    #[test]
    fn test_bulkhead_zero_is_clamped() {
        let bulkhead = Bulkhead::new(0);
        assert_eq!(bulkhead.max_concurrent(), 1);
    }
}

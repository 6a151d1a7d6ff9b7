// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker pattern for ownership-source protection.
//!
//! Prevents hammering an endpoint that is already failing. One breaker exists
//! per logical endpoint, created lazily by [`CircuitRegistry`].
//!
//! # States
//!
//! ```text
//!            threshold consecutive failures
//!   Closed ───────────────────────────────────→ Open
//!     ↑                                          │
//!     │ first success          reset_timeout     │
//!     │                        elapsed           ↓
//!     └─────────────────────────────────────── HalfOpen
//!                                   failure ──→ Open
//! ```
//!
//! - **Closed**: requests pass through, consecutive failures are counted
//! - **Open**: requests fail fast with [`SyncError::CircuitOpen`] without invoking the operation
//! - **HalfOpen**: calls go through again; the first outcome decides
//!
//! Admission is decided by [`recloser`]: a ring of `failure_threshold` calls
//! that trips only when every slot is a failure, and a half-open ring of one.
//! A dropped half-open call leaves the breaker half-open, so the next caller
//! becomes the trial.
//!
//! Only endpoint-health failures (network, timeout, server) feed the breaker.
//! Caller-side rejections such as validation errors mean the endpoint answered.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use profile_sync_engine::circuit_breaker::{CircuitBreaker, CircuitConfig};
//! # use profile_sync_engine::SyncError;
//! # async fn example() {
//! let circuit = CircuitBreaker::new("ownership", CircuitConfig::default());
//!
//! match circuit.call(|| async { Ok::<u32, SyncError>(1) }).await {
//!     Ok(_) => { /* success */ }
//!     Err(e) if e.is_circuit_open() => { /* fast-failed, operation not invoked */ }
//!     Err(_) => { /* operation error */ }
//! }
//! # }
//! ```

use crate::error::{Result, SyncError};
use crate::metrics;
use dashmap::DashMap;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed = 0,
    /// Testing if service recovered
    HalfOpen = 1,
    /// Service unhealthy, fail-fast
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit.
    pub failure_threshold: u32,
    /// How long to stay open before letting a trial request through.
    pub reset_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips faster and waits longer before recovery.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }

    /// Tolerates more failures.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(15),
        }
    }

    /// Fast recovery for testing.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(50),
        }
    }

    /// Recloser equivalent: the closed ring holds `failure_threshold` calls
    /// and trips only when all of them failed.
    fn recloser(&self) -> AsyncRecloser {
        let ring = self.failure_threshold.max(1) as usize;
        let error_rate = 1.0 - 0.5 / ring as f32;
        Recloser::custom()
            .error_rate(error_rate)
            .closed_len(ring)
            .half_open_len(1)
            .open_wait(self.reset_timeout)
            .build()
            .into()
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub state: CircuitState,
}

/// Observed state, mirrored from call outcomes.
#[derive(Debug, Default)]
struct Observed {
    failure_count: u32,
    last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
}

/// A named circuit breaker with metrics tracking.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: AsyncRecloser,
    observed: Mutex<Observed>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            inner: config.recloser(),
            config,
            observed: Mutex::new(Observed::default()),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Observed> {
        self.observed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_of(&self, observed: &Observed) -> CircuitState {
        match observed.opened_at {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() >= self.config.reset_timeout => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    /// Current state. Open turns into HalfOpen once `reset_timeout` elapsed.
    pub fn state(&self) -> CircuitState {
        let observed = self.lock();
        self.state_of(&observed)
    }

    /// Snapshot of counters and state.
    pub fn snapshot(&self) -> CircuitBreakerState {
        let observed = self.lock();
        CircuitBreakerState {
            failure_count: observed.failure_count,
            last_failure_time: observed.last_failure_time,
            state: self.state_of(&observed),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    fn on_success(&self) {
        let mut observed = self.lock();
        let was = self.state_of(&observed);
        observed.failure_count = 0;
        observed.opened_at = None;
        if was != CircuitState::Closed {
            info!(circuit = %self.name, "Circuit closed after successful trial");
            metrics::set_circuit_state(&self.name, "closed");
        }
    }

    fn on_failure(&self) {
        let mut observed = self.lock();
        let now = Instant::now();
        observed.last_failure_time = Some(now);
        match self.state_of(&observed) {
            CircuitState::HalfOpen => {
                observed.opened_at = Some(now);
                warn!(circuit = %self.name, "Trial request failed, circuit re-opened");
                metrics::set_circuit_state(&self.name, "open");
            }
            CircuitState::Closed => {
                observed.failure_count += 1;
                if observed.failure_count >= self.config.failure_threshold.max(1) {
                    observed.opened_at = Some(now);
                    warn!(
                        circuit = %self.name,
                        failures = observed.failure_count,
                        threshold = self.config.failure_threshold,
                        reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                        "Circuit breaker opened"
                    );
                    metrics::set_circuit_state(&self.name, "open");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// When open, returns [`SyncError::CircuitOpen`] without calling `f`.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let health = |e: &SyncError| e.is_retryable();
        match self.inner.call_with(health, f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.on_success();
                metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_rejection(&self.name);
                debug!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(SyncError::circuit_open(&self.name))
            }
            Err(RecloserError::Inner(e)) if e.is_retryable() => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.on_failure();
                metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, error = %e, "Circuit call failed");
                Err(e)
            }
            Err(RecloserError::Inner(e)) => {
                // The endpoint answered; the request itself was refused.
                self.on_success();
                metrics::record_circuit_call(&self.name, "rejected_by_endpoint");
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 - 1.0).
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }
}

/// Lazily created breakers, one per logical endpoint.
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `endpoint`, created on first use.
    pub fn get(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.config.clone())))
            .clone()
    }

    /// Endpoints with their current state.
    pub fn snapshot(&self) -> Vec<(String, CircuitBreakerState)> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn any_open(&self) -> bool {
        self.breakers.iter().any(|entry| entry.value().is_open())
    }
}

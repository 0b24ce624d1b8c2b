//! Circuit breaker and retry runtime guarding a single store.
//!
//! Allocation must answer even when the backing store degrades, so
//! every store call is routed through a [`StorageRuntime`]: transient
//! errors are retried with bounded backoff, sustained failure opens
//! the circuit and sheds load until the store recovers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uplift_core::{UpliftError, UpliftResult};

// ─── Circuit Breaker ────────────────────────────────────────────────────

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; requests pass through.
    Closed,
    /// Too many failures; requests are rejected.
    Open,
    /// Testing recovery; limited requests allowed.
    HalfOpen,
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit.
    pub failure_threshold: u32,
    /// Duration the circuit stays open before moving to half-open.
    pub open_duration_secs: u64,
    /// Number of successful requests in half-open to close the circuit.
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_secs: 30,
            half_open_successes: 3,
        }
    }
}

/// Circuit breaker protecting a single store.
pub struct CircuitBreaker {
    pub config: CircuitBreakerConfig,
    store: String,
    state: parking_lot::Mutex<CircuitState>,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    opened_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl CircuitBreaker {
    pub fn new(store: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            store: store.into(),
            state: parking_lot::Mutex::new(CircuitState::Closed),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            opened_at: parking_lot::Mutex::new(None),
        }
    }

    /// Check if a request is allowed through the circuit.
    pub fn allow_request(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened = self.opened_at.lock();
                if let Some(opened_at) = *opened {
                    let elapsed = (Utc::now() - opened_at).num_seconds() as u64;
                    if elapsed >= self.config.open_duration_secs {
                        *state = CircuitState::HalfOpen;
                        self.success_count.store(0, Ordering::Relaxed);
                        info!(store = %self.store, "storage circuit transitioning to half-open");
                        return true;
                    }
                }
                false
            }
            CircuitState::HalfOpen => true,
        }
    }

    /// Record a successful round trip.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match *state {
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.half_open_successes as u64 {
                    *state = CircuitState::Closed;
                    self.failure_count.store(0, Ordering::Relaxed);
                    self.success_count.store(0, Ordering::Relaxed);
                    info!(store = %self.store, "storage circuit closed after recovery");
                }
            }
            CircuitState::Closed => {
                // Reset failure count on success
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed round trip.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.failure_threshold as u64 {
                    *state = CircuitState::Open;
                    *self.opened_at.lock() = Some(Utc::now());
                    warn!(store = %self.store, failures = count, "storage circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open goes back to open
                *state = CircuitState::Open;
                *self.opened_at.lock() = Some(Utc::now());
                self.success_count.store(0, Ordering::Relaxed);
                warn!(store = %self.store, "storage circuit re-opened from half-open");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        *self.state.lock()
    }
}

// ─── Retry Policy ───────────────────────────────────────────────────────

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
    /// Backoff multiplier per attempt.
    pub backoff_multiplier: f64,
    /// Whether to add jitter.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff duration for a given attempt (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64);

        let final_ms = if self.jitter {
            // Simple deterministic jitter: vary by ±25%
            let jitter_factor = 0.75 + (attempt as f64 * 0.1 % 0.5);
            capped_ms * jitter_factor
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms as u64)
    }
}

// ─── Storage Runtime ────────────────────────────────────────────────────

/// Snapshot of one runtime's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMetrics {
    pub store: String,
    pub ops_total: u64,
    pub ops_failed: u64,
    pub retries_total: u64,
    pub rejected_total: u64,
    pub circuit_state: CircuitState,
}

/// Guards every round trip to one store with breaker plus retry.
pub struct StorageRuntime {
    store: String,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    ops_total: AtomicU64,
    ops_failed: AtomicU64,
    retries_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl StorageRuntime {
    pub fn new(
        store: impl Into<String>,
        breaker_config: CircuitBreakerConfig,
        retry: RetryPolicy,
    ) -> Self {
        let store = store.into();
        Self {
            breaker: CircuitBreaker::new(store.clone(), breaker_config),
            store,
            retry,
            ops_total: AtomicU64::new(0),
            ops_failed: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Runtime with default breaker and retry settings.
    pub fn with_defaults(store: impl Into<String>) -> Self {
        Self::new(store, CircuitBreakerConfig::default(), RetryPolicy::default())
    }

    /// Execute one store operation through the breaker and retry policy.
    ///
    /// Transient errors are retried up to `max_retries` times; anything
    /// else returns immediately without tripping the breaker. A rejected
    /// call fails fast with `CircuitOpen` and never invokes the closure.
    pub fn run<T>(&self, op: &str, mut f: impl FnMut() -> UpliftResult<T>) -> UpliftResult<T> {
        if !self.breaker.allow_request() {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            return Err(UpliftError::CircuitOpen(format!("{}.{op}", self.store)));
        }

        self.ops_total.fetch_add(1, Ordering::Relaxed);
        let mut attempt: u32 = 0;
        loop {
            match f() {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff_for_attempt(attempt);
                    warn!(
                        store = %self.store,
                        op,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient storage error, retrying"
                    );
                    self.retries_total.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(err) => {
                    self.ops_failed.fetch_add(1, Ordering::Relaxed);
                    if err.is_transient() {
                        self.breaker.record_failure();
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Get current metrics snapshot.
    pub fn metrics(&self) -> StorageMetrics {
        StorageMetrics {
            store: self.store.clone(),
            ops_total: self.ops_total.load(Ordering::Relaxed),
            ops_failed: self.ops_failed.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            circuit_state: self.breaker.state(),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }
}

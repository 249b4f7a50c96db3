//! # Circuit Breaker Implementation
//!
//! Per-endpoint fault isolation with the classic three states: Closed
//! (normal operation), Open (failing fast), and Half-Open (probing recovery).
//!
//! Admission and outcome recording are separate operations. Every admitted
//! call holds a [`CallPermit`] that must be resolved with `success()`,
//! `failure()` or `release()`; a permit dropped unresolved is released, so
//! half-open probe slots can never leak.
//!
//! All state lives in one record guarded by its own lock. The lock is never
//! held across an `.await`.

use crate::logging::log_breaker_transition;
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lock-free counters for call outcomes, kept outside the state record so
/// metrics never contend with admission.
#[derive(Debug, Default)]
struct AtomicCallCounters {
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    rejected_count: AtomicU64,
    total_duration_nanos: AtomicU64,
}

impl AtomicCallCounters {
    #[inline]
    fn record_success(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    fn record_failure(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    fn record_rejection(&self) {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Probing recovery - a bounded number of calls are allowed through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call refused by the breaker without reaching the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerRejection {
    pub endpoint_key: String,
    pub state: CircuitState,
    /// Remaining cooldown when open; `None` when half-open probes are saturated
    pub retry_in: Option<Duration>,
}

/// Errors that can occur during closure-style circuit breaker calls
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {endpoint_key}")]
    CircuitOpen {
        endpoint_key: String,
        retry_in: Option<Duration>,
    },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

#[derive(Debug)]
struct BreakerRecord {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    /// Bumped on every transition; permits from an older generation no
    /// longer own a probe slot
    generation: u64,
}

impl BreakerRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            half_open_in_flight: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        self.half_open_in_flight = 0;
        self.consecutive_successes = 0;
        match to {
            CircuitState::Open => self.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.opened_at = None;
            }
            CircuitState::HalfOpen => {}
        }
        (from, to)
    }

    fn owns_probe(&self, generation: u64, probe: bool) -> bool {
        probe && self.state == CircuitState::HalfOpen && self.generation == generation
    }
}

/// Admission token for one call through the breaker
#[must_use = "a permit must be resolved with success(), failure() or release()"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    started_at: Instant,
    resolved: bool,
}

impl CallPermit<'_> {
    /// Whether this call was admitted as a half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record a successful call
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker
            .on_success(self.generation, self.probe, self.started_at.elapsed());
    }

    /// Record a failure that reflects endpoint health
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker
            .on_failure(self.generation, self.probe, self.started_at.elapsed());
    }

    /// Give the slot back without recording an outcome
    pub fn release(mut self) {
        self.resolved = true;
        self.breaker.on_release(self.generation, self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_release(self.generation, self.probe);
        }
    }
}

/// Circuit breaker for one endpoint key
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint_key: String,
    config: CircuitBreakerConfig,
    record: Mutex<BreakerRecord>,
    counters: AtomicCallCounters,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given endpoint key and configuration
    pub fn new(endpoint_key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let endpoint_key = endpoint_key.into();
        debug!(
            endpoint_key = %endpoint_key,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            cooldown_ms = config.cooldown.as_millis() as u64,
            half_open_probe_limit = config.half_open_probe_limit,
            "Circuit breaker initialized"
        );

        Self {
            endpoint_key,
            config,
            record: Mutex::new(BreakerRecord::new()),
            counters: AtomicCallCounters::default(),
        }
    }

    /// Current recorded state. An open breaker whose cooldown has elapsed
    /// still reports `Open` until the next admission attempt.
    pub fn state(&self) -> CircuitState {
        self.record.lock().state
    }

    pub fn endpoint_key(&self) -> &str {
        &self.endpoint_key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Remaining cooldown while open, `None` otherwise
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let record = self.record.lock();
        match (record.state, record.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                Some(self.config.cooldown.saturating_sub(opened_at.elapsed()))
            }
            _ => None,
        }
    }

    /// Ask to make one call. Moves an expired open breaker to half-open.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, BreakerRejection> {
        let mut transition = None;

        let admission = {
            let mut record = self.record.lock();

            if record.state == CircuitState::Open {
                let elapsed = record
                    .opened_at
                    .map(|opened_at| opened_at.elapsed())
                    .unwrap_or(self.config.cooldown);
                if elapsed >= self.config.cooldown {
                    transition = Some(record.transition(CircuitState::HalfOpen));
                }
            }

            match record.state {
                CircuitState::Closed => Ok((record.generation, false)),
                CircuitState::HalfOpen
                    if record.half_open_in_flight < self.config.half_open_probe_limit =>
                {
                    record.half_open_in_flight += 1;
                    Ok((record.generation, true))
                }
                CircuitState::HalfOpen => Err((CircuitState::HalfOpen, None)),
                CircuitState::Open => Err((
                    CircuitState::Open,
                    record
                        .opened_at
                        .map(|opened_at| self.config.cooldown.saturating_sub(opened_at.elapsed())),
                )),
            }
        };

        if let Some((from, to)) = transition {
            self.log_transition(from, to);
        }

        match admission {
            Ok((generation, probe)) => Ok(CallPermit {
                breaker: self,
                generation,
                probe,
                started_at: Instant::now(),
                resolved: false,
            }),
            Err((state, retry_in)) => {
                self.counters.record_rejection();
                debug!(
                    endpoint_key = %self.endpoint_key,
                    state = %state,
                    retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
                    "Call rejected by circuit breaker"
                );
                Err(BreakerRejection {
                    endpoint_key: self.endpoint_key.clone(),
                    state,
                    retry_in,
                })
            }
        }
    }

    /// Execute an operation with circuit breaker protection. Every `Err`
    /// counts as a breaker failure.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self
            .try_acquire()
            .map_err(|rejection| CircuitBreakerError::CircuitOpen {
                endpoint_key: rejection.endpoint_key,
                retry_in: rejection.retry_in,
            })?;

        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(error) => {
                permit.failure();
                Err(CircuitBreakerError::OperationFailed(error))
            }
        }
    }

    fn on_success(&self, generation: u64, probe: bool, duration: Duration) {
        self.counters.record_success(duration);

        let transition = {
            let mut record = self.record.lock();
            match record.state {
                CircuitState::Closed => {
                    record.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen if record.owns_probe(generation, probe) => {
                    record.half_open_in_flight = record.half_open_in_flight.saturating_sub(1);
                    record.consecutive_successes += 1;
                    if record.consecutive_successes >= self.config.success_threshold {
                        Some(record.transition(CircuitState::Closed))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };

        if let Some((from, to)) = transition {
            self.log_transition(from, to);
        }
    }

    fn on_failure(&self, generation: u64, probe: bool, duration: Duration) {
        self.counters.record_failure(duration);

        let transition = {
            let mut record = self.record.lock();
            match record.state {
                CircuitState::Closed => {
                    record.consecutive_failures += 1;
                    if record.consecutive_failures >= self.config.failure_threshold {
                        Some(record.transition(CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if !record.owns_probe(generation, probe) {
                        debug!(
                            endpoint_key = %self.endpoint_key,
                            "Stale call failed while half-open"
                        );
                    }
                    record.consecutive_failures += 1;
                    Some(record.transition(CircuitState::Open))
                }
                CircuitState::Open => None,
            }
        };

        if let Some((from, to)) = transition {
            self.log_transition(from, to);
        }
    }

    fn on_release(&self, generation: u64, probe: bool) {
        let mut record = self.record.lock();
        if record.owns_probe(generation, probe) {
            record.half_open_in_flight = record.half_open_in_flight.saturating_sub(1);
        }
    }

    fn log_transition(&self, from: CircuitState, to: CircuitState) {
        let details = match to {
            CircuitState::Open => format!(
                "failing fast for {}ms",
                self.config.cooldown.as_millis()
            ),
            CircuitState::HalfOpen => format!(
                "admitting up to {} probe(s)",
                self.config.half_open_probe_limit
            ),
            CircuitState::Closed => "recovered".to_string(),
        };
        log_breaker_transition(&self.endpoint_key, from.as_str(), to.as_str(), Some(&details));
    }

    /// Force circuit to open state
    pub fn force_open(&self) {
        warn!(endpoint_key = %self.endpoint_key, "Circuit breaker forced open");
        let (from, to) = self.record.lock().transition(CircuitState::Open);
        self.log_transition(from, to);
    }

    /// Force circuit to closed state
    pub fn force_closed(&self) {
        warn!(endpoint_key = %self.endpoint_key, "Circuit breaker forced closed");
        let (from, to) = self.record.lock().transition(CircuitState::Closed);
        self.log_transition(from, to);
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let (state, consecutive_failures, consecutive_successes, half_open_in_flight) = {
            let record = self.record.lock();
            (
                record.state,
                record.consecutive_failures,
                record.consecutive_successes,
                record.half_open_in_flight,
            )
        };

        let total_calls = self.counters.total_calls.load(Ordering::Relaxed);
        let success_count = self.counters.success_count.load(Ordering::Relaxed);
        let failure_count = self.counters.failure_count.load(Ordering::Relaxed);
        let total_duration_nanos = self.counters.total_duration_nanos.load(Ordering::Relaxed);

        let (failure_rate, success_rate, average_duration) = if total_calls > 0 {
            (
                failure_count as f64 / total_calls as f64,
                success_count as f64 / total_calls as f64,
                Duration::from_nanos(total_duration_nanos / total_calls),
            )
        } else {
            (0.0, 0.0, Duration::ZERO)
        };

        CircuitBreakerMetrics {
            total_calls,
            success_count,
            failure_count,
            rejected_count: self.counters.rejected_count.load(Ordering::Relaxed),
            consecutive_failures,
            consecutive_successes,
            half_open_in_flight,
            current_state: state,
            failure_rate,
            success_rate,
            average_duration,
        }
    }

    /// Closed with a low failure rate
    pub fn is_healthy(&self) -> bool {
        self.metrics().is_healthy()
    }
}

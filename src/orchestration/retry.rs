//! # Retry Manager
//!
//! Drives one task's attempts against its executor. Each attempt is gated by
//! the endpoint's circuit breaker, classified on failure, and followed by an
//! exponential backoff sleep when the fault is retryable and attempts remain.
//!
//! ## Backoff
//!
//! For the n-th retry (n = 0 for the first retry):
//!
//! ```text
//! delay = min(max_delay, base_delay * backoff_factor^n) * (1 ± jitter_factor)
//! ```
//!
//! A provider-suggested delay replaces the computed one when
//! `respect_retry_after` is set, and a breaker rejection waits out the
//! remaining cooldown. Both are capped at `max_delay`.
//!
//! Attempts within a task are strictly sequential. Sleeping holds no lock
//! and wakes early on cancellation.

use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::budget::BudgetTracker;
use super::error_classifier::{ErrorCategory, ErrorClassifier, StandardErrorClassifier};
use super::types::{Fault, Task, TaskResult, Usage};
use crate::constants::system;
use crate::events::{EventError, EventPublisher, TaskEvent};
use crate::execution::{ExecutionContext, ExecutionError, ExecutionOutput, ProgressReporter, TaskExecutor};
use crate::logging::log_task_operation;
use crate::resilience::CircuitBreakerRegistry;

/// Retry configuration, read-only during execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Upper bound on executor calls, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Fractional jitter applied symmetrically (0.1 = ±10%)
    pub jitter_factor: f64,
    /// Categories retried when the fault does not flag itself
    pub retry_on: HashSet<ErrorCategory>,
    /// Honor provider-suggested delays
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: system::DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(system::DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(system::DEFAULT_MAX_DELAY_MS),
            backoff_factor: system::DEFAULT_BACKOFF_FACTOR,
            jitter_factor: system::DEFAULT_JITTER_FACTOR,
            retry_on: ErrorCategory::default_retryable().iter().copied().collect(),
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn with_retry_on<I: IntoIterator<Item = ErrorCategory>>(mut self, categories: I) -> Self {
        self.retry_on = categories.into_iter().collect();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err("backoff_factor must be a finite number >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("jitter_factor must be between 0.0 and 1.0".to_string());
        }
        if self.base_delay > self.max_delay {
            return Err("base_delay must not exceed max_delay".to_string());
        }
        Ok(())
    }

    /// Whether a classified fault should be retried. An explicit flag on the
    /// fault wins over category policy; orchestration-level faults never retry.
    pub fn should_retry(&self, category: ErrorCategory, explicit: Option<bool>) -> bool {
        if category.is_orchestration_level() {
            return false;
        }
        explicit.unwrap_or_else(|| self.retry_on.contains(&category))
    }

    /// Exponential delay before the n-th retry, without jitter
    pub fn exponential_delay(&self, retry_index: u32) -> Duration {
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Apply jitter. `sample` is uniform in [-1.0, 1.0].
    pub fn apply_jitter(&self, delay: Duration, sample: f64) -> Duration {
        let factor = 1.0 + self.jitter_factor * sample.clamp(-1.0, 1.0);
        Duration::try_from_secs_f64((delay.as_secs_f64() * factor).max(0.0)).unwrap_or(delay)
    }

    /// Delay before the n-th retry given the failing attempt's fault
    pub fn delay_for<R: Rng>(&self, retry_index: u32, fault: &Fault, rng: &mut R) -> Duration {
        let hinted = match fault.category {
            ErrorCategory::BreakerOpen => fault.suggested_delay,
            _ if self.respect_retry_after => fault.suggested_delay,
            _ => None,
        };

        match hinted {
            Some(hint) => hint.min(self.max_delay),
            None => {
                let sample = if self.jitter_factor > 0.0 {
                    rng.gen_range(-1.0..=1.0)
                } else {
                    0.0
                };
                self.apply_jitter(self.exponential_delay(retry_index), sample)
            }
        }
    }
}

/// Bookkeeping for one task's retry sequence; discarded on completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryState {
    pub attempts: u32,
    pub total_delay: Duration,
    pub errors: Vec<Fault>,
}

/// Per-run knobs for a task's retry loop
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Observed between attempts and during backoff sleeps
    pub cancellation: CancellationToken,
    /// Run-wide deadline, combined with the task's own duration budget
    pub deadline: Option<Instant>,
    /// Seeds jitter and is handed to the executor
    pub seed: Option<u64>,
    /// Run-wide budget that receives every attempt's usage
    pub budget: Option<Arc<BudgetTracker>>,
}

impl Default for RetryContext {
    fn default() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            deadline: None,
            seed: None,
            budget: None,
        }
    }
}

enum AttemptOutcome {
    Succeeded(ExecutionOutput),
    Failed(Fault),
}

/// Executes tasks with bounded retry through per-endpoint circuit breakers
pub struct RetryManager {
    classifier: Arc<dyn ErrorClassifier>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: Option<EventPublisher>,
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("classifier", &self.classifier.classifier_name())
            .field("breakers", &self.breakers.list_endpoints())
            .field("events", &self.events.is_some())
            .finish()
    }
}

impl RetryManager {
    pub fn new(classifier: Arc<dyn ErrorClassifier>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            classifier,
            breakers,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn classifier(&self) -> &Arc<dyn ErrorClassifier> {
        &self.classifier
    }

    /// Run a task to completion with no run-wide budget or cancellation
    pub async fn execute_with_retry(
        &self,
        task: &Task,
        executor: &dyn TaskExecutor,
        policy: &RetryPolicy,
    ) -> TaskResult {
        self.execute_with_context(task, executor, policy, RetryContext::default())
            .await
    }

    /// Run a task to completion. Never fails: every outcome is a `TaskResult`.
    pub async fn execute_with_context(
        &self,
        task: &Task,
        executor: &dyn TaskExecutor,
        policy: &RetryPolicy,
        context: RetryContext,
    ) -> TaskResult {
        let started_at = Instant::now();
        let task_deadline = task.budget.max_duration.map(|d| started_at + d);
        let deadline = match (task_deadline, context.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let breaker = self.breakers.breaker_for(&task.endpoint_key);
        let mut rng = match context.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut state = RetryState::default();
        let mut usage = Usage::default();

        self.publish(TaskEvent::Start {
            task_id: task.id.clone(),
        });

        loop {
            if let Some(fault) = self.cancellation_fault(&context) {
                return self.finish(
                    TaskResult::cancelled(&task.id, fault, usage, state.attempts, started_at.elapsed()),
                    task,
                    true,
                );
            }
            if let Some(fault) = task_budget_fault(task, task_deadline, usage) {
                return self.finish(
                    TaskResult::failed(&task.id, fault, usage, state.attempts, started_at.elapsed()),
                    task,
                    true,
                );
            }

            state.attempts += 1;
            let attempt = state.attempts;

            let outcome = match breaker.as_deref().map(|b| b.try_acquire()) {
                Some(Err(rejection)) => {
                    let fault = match rejection.retry_in {
                        Some(retry_in) => Fault::breaker_open(&rejection.endpoint_key, retry_in),
                        None => Fault {
                            suggested_delay: None,
                            ..Fault::breaker_open(&rejection.endpoint_key, Duration::ZERO)
                        },
                    };
                    AttemptOutcome::Failed(fault)
                }
                admitted => {
                    let permit = admitted.and_then(Result::ok);
                    let execution_context = ExecutionContext {
                        task_id: task.id.clone(),
                        attempt,
                        deadline,
                        seed: context.seed,
                        cancellation: context.cancellation.clone(),
                        progress: ProgressReporter::new(task.id.clone(), self.events.clone()),
                    };

                    let result = AssertUnwindSafe(executor.execute(&task.payload, &execution_context))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(panic_error(panic)));

                    match result {
                        Ok(output) => {
                            if let Some(permit) = permit {
                                permit.success();
                            }
                            self.account(&context, &mut usage, output.usage);
                            AttemptOutcome::Succeeded(output)
                        }
                        Err(error) => {
                            self.account(&context, &mut usage, error.usage);
                            let classification =
                                self.classifier.classify(&error, executor.endpoint_kind());
                            match permit {
                                Some(permit) if classification.category.counts_toward_breaker() => {
                                    permit.failure()
                                }
                                Some(permit) => permit.release(),
                                None => {}
                            }
                            AttemptOutcome::Failed(Fault {
                                category: classification.category,
                                message: error.message,
                                retryable: policy
                                    .should_retry(classification.category, error.retryable),
                                suggested_delay: classification.suggested_delay,
                            })
                        }
                    }
                }
            };

            let mut fault = match outcome {
                AttemptOutcome::Succeeded(output) => {
                    let duration = started_at.elapsed();
                    self.publish(TaskEvent::Complete {
                        task_id: task.id.clone(),
                        duration,
                        usage,
                    });
                    return self.finish(
                        TaskResult::succeeded(&task.id, output.output, usage, attempt, duration),
                        task,
                        false,
                    );
                }
                AttemptOutcome::Failed(fault) => fault,
            };

            if fault.category == ErrorCategory::BreakerOpen {
                fault.retryable = policy.should_retry(fault.category, None);
            }

            self.publish(TaskEvent::Error {
                task_id: task.id.clone(),
                error: EventError::from(&fault),
            });
            state.errors.push(fault.clone());

            if !fault.retryable || attempt >= policy.max_attempts {
                debug!(
                    task_id = %task.id,
                    attempt = attempt,
                    category = %fault.category,
                    retryable = fault.retryable,
                    "Task failed without further retries"
                );
                return self.finish(
                    TaskResult::failed(&task.id, fault, usage, attempt, started_at.elapsed()),
                    task,
                    false,
                );
            }

            let delay = policy.delay_for(attempt - 1, &fault, &mut rng);
            if deadline.is_some_and(|deadline| Instant::now() + delay > deadline) {
                debug!(
                    task_id = %task.id,
                    delay_ms = delay.as_millis() as u64,
                    "Backoff would pass the deadline, surfacing last fault"
                );
                return self.finish(
                    TaskResult::failed(&task.id, fault, usage, attempt, started_at.elapsed()),
                    task,
                    false,
                );
            }

            warn!(
                task_id = %task.id,
                endpoint_key = %task.endpoint_key,
                attempt = attempt,
                max_attempts = policy.max_attempts,
                category = %fault.category,
                delay_ms = delay.as_millis() as u64,
                "Retrying task after backoff"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = context.cancellation.cancelled() => {}
            }
            state.total_delay += delay;
        }
    }

    fn cancellation_fault(&self, context: &RetryContext) -> Option<Fault> {
        if let Some(budget) = &context.budget {
            return budget.check().err();
        }
        context
            .cancellation
            .is_cancelled()
            .then(|| Fault::new(ErrorCategory::Unknown, "cancelled by caller", false))
    }

    fn account(&self, context: &RetryContext, total: &mut Usage, usage: Usage) {
        *total += usage;
        if let Some(budget) = &context.budget {
            budget.record(usage);
        }
    }

    /// Log the final result; `publish_error` emits `on_error` for faults not
    /// already published by the attempt that produced them
    fn finish(&self, result: TaskResult, task: &Task, publish_error: bool) -> TaskResult {
        if let (true, Some(fault)) = (publish_error, &result.error) {
            self.publish(TaskEvent::Error {
                task_id: task.id.clone(),
                error: EventError::from(fault),
            });
        }

        log_task_operation(
            "execute",
            &task.id,
            Some(&task.endpoint_key),
            &result.status.to_string(),
            Some(result.attempts),
            Some(result.duration),
        );
        result
    }

    fn publish(&self, event: TaskEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(
            Arc::new(StandardErrorClassifier::new()),
            Arc::new(CircuitBreakerRegistry::default()),
        )
    }
}

/// Fault when the task's own duration or cost budget is spent
fn task_budget_fault(task: &Task, task_deadline: Option<Instant>, usage: Usage) -> Option<Fault> {
    if let (Some(deadline), Some(max_duration)) = (task_deadline, task.budget.max_duration) {
        if Instant::now() >= deadline {
            return Some(Fault::budget_exceeded(format!(
                "task duration budget of {}ms exhausted",
                max_duration.as_millis()
            )));
        }
    }
    if let Some(max_cost) = task.budget.max_cost_units {
        if usage.cost_units >= max_cost {
            return Some(Fault::budget_exceeded(format!(
                "task cost budget of {max_cost} units exhausted"
            )));
        }
    }
    None
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> ExecutionError {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    ExecutionError::new(format!("executor panicked: {detail}"))
        .with_category(ErrorCategory::Unknown)
        .with_retryable(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::default()
            .with_delays(Duration::from_secs(1), Duration::from_secs(5))
            .with_backoff_factor(2.0);

        assert_eq!(policy.exponential_delay(0), Duration::from_secs(1));
        assert_eq!(policy.exponential_delay(1), Duration::from_secs(2));
        assert_eq!(policy.exponential_delay(2), Duration::from_secs(4));
        assert_eq!(policy.exponential_delay(3), Duration::from_secs(5));
        assert_eq!(policy.exponential_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let policy = RetryPolicy::default().with_jitter(0.1);
        let base = Duration::from_secs(10);
        assert_eq!(policy.apply_jitter(base, 1.0), Duration::from_secs(11));
        assert_eq!(policy.apply_jitter(base, -1.0), Duration::from_secs(9));

        let mut rng = StdRng::seed_from_u64(7);
        let fault = Fault::new(ErrorCategory::Network, "reset", true);
        for retry_index in 0..4 {
            let delay = policy.delay_for(retry_index, &fault, &mut rng);
            let nominal = policy.exponential_delay(retry_index).as_secs_f64();
            assert!(delay.as_secs_f64() >= nominal * 0.9 - 1e-9);
            assert!(delay.as_secs_f64() <= nominal * 1.1 + 1e-9);
        }
    }

    #[test]
    fn test_retry_after_precedence() {
        let mut rng = StdRng::seed_from_u64(1);
        let fault = Fault {
            suggested_delay: Some(Duration::from_secs(7)),
            ..Fault::new(ErrorCategory::RateLimit, "slow down", true)
        };

        let policy = RetryPolicy::default().with_jitter(0.0);
        assert_eq!(policy.delay_for(0, &fault, &mut rng), Duration::from_secs(7));

        let ignoring = RetryPolicy {
            respect_retry_after: false,
            ..policy.clone()
        };
        assert_eq!(ignoring.delay_for(0, &fault, &mut rng), Duration::from_secs(1));

        let long_hint = Fault {
            suggested_delay: Some(Duration::from_secs(600)),
            ..fault
        };
        assert_eq!(policy.delay_for(0, &long_hint, &mut rng), policy.max_delay);
    }

    #[test]
    fn test_should_retry_explicit_flag_wins() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(ErrorCategory::Network, None));
        assert!(!policy.should_retry(ErrorCategory::Validation, None));
        assert!(policy.should_retry(ErrorCategory::Validation, Some(true)));
        assert!(!policy.should_retry(ErrorCategory::Network, Some(false)));
        assert!(!policy.should_retry(ErrorCategory::BudgetExceeded, Some(true)));
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::default().with_max_attempts(0).validate().is_err());
        assert!(RetryPolicy::default().with_jitter(1.5).validate().is_err());
        assert!(RetryPolicy::default()
            .with_backoff_factor(0.5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_panic_payloads_become_unknown_faults() {
        let error = panic_error(Box::new("boom"));
        assert_eq!(error.category, Some(ErrorCategory::Unknown));
        assert!(error.message.contains("boom"));
    }
}

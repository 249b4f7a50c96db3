//! # Orchestrator
//!
//! Runs a set of tasks concurrently under a parallelism cap, wrapping each in
//! the idempotency check and the retry loop, and folds the per-task results
//! into one `OrchestrationOutput`.
//!
//! Admission follows priority (highest first, submission order among equal
//! priorities). Before each admission the run's global budget is checked;
//! once it is exhausted, or the caller cancels, nothing else is admitted and
//! in-flight tasks observe the cancellation at their next safe point. Tasks
//! that never started are reported as `cancelled` so the output always holds
//! one result per submitted task, in submission order.

use futures::FutureExt;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::budget::BudgetTracker;
use super::error_classifier::{ErrorCategory, ErrorClassifier, StandardErrorClassifier};
use super::retry::{RetryContext, RetryManager, RetryPolicy};
use super::types::{Fault, OrchestrationOutput, OrchestrationRequest, Task, TaskResult, Usage};
use crate::config::ScatterConfig;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::events::{EventError, EventPublisher, PublishedEvent, TaskEvent};
use crate::execution::TaskExecutor;
use crate::idempotency::{IdempotencyConfig, IdempotencyOutcome, IdempotencyStore, PendingPolicy};
use crate::logging::log_error;
use crate::resilience::CircuitBreakerRegistry;

/// Result of claiming an idempotency key before doing any work
enum Claim<T> {
    /// A completed result for the same payload; serve it again
    Replay(T),
    /// This submission owns the key and must complete or abandon it
    Owned { key: String, payload_hash: u64 },
    /// No key was supplied
    Unkeyed,
    Conflict(String),
    StillPending(String),
    /// The run was cancelled while waiting on an in-progress submission
    Cancelled(String),
}

/// Claim `key` in `store`, waiting on or rejecting an in-progress
/// submission according to the store's pending policy. A wait ends early
/// when `cancellation` fires.
async fn claim<T: Clone + Send + Sync>(
    store: &IdempotencyStore<T>,
    key: Option<&str>,
    payload_hash: u64,
    cancellation: &CancellationToken,
) -> Claim<T> {
    let Some(key) = key else {
        return Claim::Unkeyed;
    };

    let outcome = match store.get_or_begin(key, payload_hash) {
        IdempotencyOutcome::Pending => match store.config().pending_policy {
            PendingPolicy::Wait { max_wait } => tokio::select! {
                outcome = store.wait_for(key, payload_hash, max_wait) => outcome,
                _ = cancellation.cancelled() => return Claim::Cancelled(key.to_string()),
            },
            PendingPolicy::Reject => IdempotencyOutcome::Pending,
        },
        outcome => outcome,
    };

    match outcome {
        IdempotencyOutcome::Existing(result) => Claim::Replay(result),
        IdempotencyOutcome::Begin => Claim::Owned {
            key: key.to_string(),
            payload_hash,
        },
        IdempotencyOutcome::Conflict => Claim::Conflict(key.to_string()),
        IdempotencyOutcome::Pending => Claim::StillPending(key.to_string()),
    }
}

/// Shared pieces each spawned task needs
#[derive(Clone)]
struct TaskRunner {
    executor: Arc<dyn TaskExecutor>,
    retry_manager: Arc<RetryManager>,
    policy: Arc<RetryPolicy>,
    task_store: Arc<IdempotencyStore<TaskResult>>,
    events: EventPublisher,
}

impl TaskRunner {
    async fn run(&self, task: &Task, seed: Option<u64>, budget: Arc<BudgetTracker>) -> TaskResult {
        let claimed = claim(
            &self.task_store,
            task.idempotency_key.as_deref(),
            task.payload_hash(),
            budget.token(),
        )
        .await;

        let ownership = match claimed {
            Claim::Replay(prior) => {
                debug!(
                    task_id = %task.id,
                    original_task_id = %prior.task_id,
                    "Replaying completed result for idempotency key"
                );
                return prior.replay_for(&task.id);
            }
            Claim::Conflict(key) => return self.rejected(task, Fault::conflict(&key)),
            Claim::StillPending(key) => {
                let fault = Fault::new(
                    ErrorCategory::Conflict,
                    format!("Idempotency key {key} is still being processed by another submission"),
                    false,
                );
                return self.rejected(task, fault);
            }
            Claim::Cancelled(key) => {
                debug!(
                    task_id = %task.id,
                    idempotency_key = %key,
                    "Run cancelled while waiting on idempotency key"
                );
                return self.cancelled(task, budget.cancellation_fault(), Duration::ZERO);
            }
            Claim::Owned { key, payload_hash } => Some((key, payload_hash)),
            Claim::Unkeyed => None,
        };

        let context = RetryContext {
            cancellation: budget.token().clone(),
            deadline: budget.deadline(),
            seed,
            budget: Some(budget),
        };
        let result = self
            .retry_manager
            .execute_with_context(task, self.executor.as_ref(), &self.policy, context)
            .await;

        if let Some((key, payload_hash)) = ownership {
            if result.is_success() {
                self.task_store.complete(&key, payload_hash, result.clone());
            } else {
                self.task_store.abandon(&key, payload_hash);
            }
        }
        result
    }

    /// Orchestration-level rejection; never touches breakers or retries
    fn rejected(&self, task: &Task, fault: Fault) -> TaskResult {
        warn!(
            task_id = %task.id,
            category = %fault.category,
            error = %fault.message,
            "Task rejected before execution"
        );
        self.events.publish(TaskEvent::Error {
            task_id: task.id.clone(),
            error: EventError::from(&fault),
        });
        TaskResult::failed(&task.id, fault, Usage::default(), 0, Duration::ZERO)
    }

    /// Task stopped by run cancellation before any executor call
    fn cancelled(&self, task: &Task, fault: Fault, duration: Duration) -> TaskResult {
        self.events.publish(TaskEvent::Error {
            task_id: task.id.clone(),
            error: EventError::from(&fault),
        });
        TaskResult::cancelled(&task.id, fault, Usage::default(), 0, duration)
    }
}

/// Scatter/gather scheduler over a single `TaskExecutor`
pub struct Orchestrator {
    runner: TaskRunner,
    request_store: Arc<IdempotencyStore<OrchestrationOutput>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("retry_manager", &self.runner.retry_manager)
            .field("policy", &self.runner.policy)
            .field("task_keys", &self.runner.task_store.len())
            .field("request_keys", &self.request_store.len())
            .finish()
    }
}

impl Orchestrator {
    /// Orchestrator with default policy, breakers, and idempotency window
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self::builder(executor).build()
    }

    pub fn builder(executor: Arc<dyn TaskExecutor>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(executor)
    }

    /// Builder preloaded from a loaded configuration
    pub fn from_config(
        executor: Arc<dyn TaskExecutor>,
        config: &ScatterConfig,
    ) -> OrchestrationResult<OrchestratorBuilder> {
        config.validate()?;

        Ok(OrchestratorBuilder::new(executor)
            .retry_policy(config.retry.to_retry_policy())
            .breakers(Arc::new(CircuitBreakerRegistry::new(
                config.circuit_breakers.clone(),
            )))
            .idempotency(config.idempotency.to_idempotency_config())
            .events(EventPublisher::new(
                config.orchestration.event_channel_capacity,
            )))
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PublishedEvent> {
        self.runner.events.subscribe()
    }

    pub fn events(&self) -> &EventPublisher {
        &self.runner.events
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.runner.retry_manager.breakers()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.runner.policy
    }

    pub fn task_store(&self) -> &Arc<IdempotencyStore<TaskResult>> {
        &self.runner.task_store
    }

    /// Run every task in the request and aggregate the results
    pub async fn run(&self, request: OrchestrationRequest) -> OrchestrationResult<OrchestrationOutput> {
        self.run_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Run with a caller-owned token; cancelling it stops admission and
    /// signals in-flight tasks the same way budget exhaustion does
    pub async fn run_with_cancellation(
        &self,
        request: OrchestrationRequest,
        cancellation: CancellationToken,
    ) -> OrchestrationResult<OrchestrationOutput> {
        validate_request(&request)?;

        // The run's budget covers any wait on an in-progress submission too
        let budget = BudgetTracker::new(request.global_budget, Some(&cancellation));
        let watchdog = budget.spawn_watchdog();
        let result = self.claim_and_execute(request, &budget).await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        result
    }

    async fn claim_and_execute(
        &self,
        request: OrchestrationRequest,
        budget: &Arc<BudgetTracker>,
    ) -> OrchestrationResult<OrchestrationOutput> {
        let claimed = claim(
            &self.request_store,
            request.idempotency_key.as_deref(),
            request.payload_hash(),
            budget.token(),
        )
        .await;

        let ownership = match claimed {
            Claim::Replay(output) => {
                info!(
                    run_id = %output.run_id,
                    "Replaying completed orchestration run for idempotency key"
                );
                return Ok(output);
            }
            Claim::Conflict(key) => return Err(OrchestrationError::IdempotencyConflict { key }),
            Claim::StillPending(key) | Claim::Cancelled(key) => {
                return Err(OrchestrationError::IdempotencyPending { key })
            }
            Claim::Owned { key, payload_hash } => Some((key, payload_hash)),
            Claim::Unkeyed => None,
        };

        let output = self.execute(request, budget).await;

        if let Some((key, payload_hash)) = ownership {
            if output.status == crate::constants::OrchestrationStatus::Succeeded {
                self.request_store
                    .complete(&key, payload_hash, output.clone());
            } else {
                self.request_store.abandon(&key, payload_hash);
            }
        }
        Ok(output)
    }

    async fn execute(
        &self,
        request: OrchestrationRequest,
        budget: &Arc<BudgetTracker>,
    ) -> OrchestrationOutput {
        let run_id = Uuid::new_v4();
        let started_at = Instant::now();
        let seed = request.deterministic_seed;
        let tasks: Vec<Arc<Task>> = request.tasks.into_iter().map(Arc::new).collect();

        info!(
            run_id = %run_id,
            task_count = tasks.len(),
            max_parallel = request.max_parallel,
            deterministic = seed.is_some(),
            "Starting orchestration run"
        );

        // Stable sort: equal priorities keep submission order
        let mut admission_order: Vec<usize> = (0..tasks.len()).collect();
        admission_order.sort_by_key(|&index| Reverse(tasks[index].priority));

        let semaphore = Arc::new(Semaphore::new(request.max_parallel));
        let mut in_flight = JoinSet::new();
        let mut results: Vec<Option<TaskResult>> = vec![None; tasks.len()];
        let mut admitted = vec![false; tasks.len()];

        for index in admission_order {
            let permit = tokio::select! {
                biased;
                _ = budget.token().cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if budget.check().is_err() {
                break;
            }

            let runner = self.runner.clone();
            let task = Arc::clone(&tasks[index]);
            let budget = Arc::clone(budget);
            let task_seed = seed.map(|seed| seed.wrapping_add(index as u64));

            admitted[index] = true;
            in_flight.spawn(async move {
                let started_at = Instant::now();
                let result = AssertUnwindSafe(runner.run(&task, task_seed, budget))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        log_error("orchestrator", "run_task", "task panicked", Some(&task.id));
                        TaskResult::failed(
                            &task.id,
                            Fault::new(ErrorCategory::Unknown, "task panicked", false),
                            Usage::default(),
                            0,
                            started_at.elapsed(),
                        )
                    });
                // Release the slot before handing the result back
                drop(permit);
                (index, result)
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(join_error) => log_error(
                    "orchestrator",
                    "join_task",
                    &join_error.to_string(),
                    Some(&run_id.to_string()),
                ),
            }
        }

        let (results, never_started) = self.settle_results(&tasks, results, &admitted, budget);

        if never_started > 0 {
            warn!(
                run_id = %run_id,
                never_started = never_started,
                reason = ?budget.reason(),
                "Tasks were never admitted"
            );
        }

        let output = OrchestrationOutput::from_results(run_id, results, started_at.elapsed());
        info!(
            run_id = %run_id,
            status = %output.status,
            succeeded = output.succeeded_count(),
            failed = output.errors.len(),
            cost_total = output.cost_total,
            total_tokens = output.usage_total.total_tokens(),
            elapsed_ms = output.elapsed.as_millis() as u64,
            "Orchestration run complete"
        );
        output
    }

    /// One result per task in submission order. A missing result is a
    /// cancellation if the task was never admitted, and a failure if it was
    /// admitted and then lost to a join error. Returns the never-admitted count.
    fn settle_results(
        &self,
        tasks: &[Arc<Task>],
        results: Vec<Option<TaskResult>>,
        admitted: &[bool],
        budget: &BudgetTracker,
    ) -> (Vec<TaskResult>, usize) {
        let mut never_started = 0usize;
        let settled = results
            .into_iter()
            .zip(tasks)
            .zip(admitted)
            .map(|((result, task), &admitted)| match result {
                Some(result) => result,
                None if admitted => TaskResult::failed(
                    &task.id,
                    Fault::new(ErrorCategory::Unknown, "task aborted", false),
                    Usage::default(),
                    0,
                    Duration::ZERO,
                ),
                None => {
                    never_started += 1;
                    self.runner
                        .cancelled(task, budget.cancellation_fault(), Duration::ZERO)
                }
            })
            .collect();
        (settled, never_started)
    }
}

/// Reject malformed requests before any task starts
fn validate_request(request: &OrchestrationRequest) -> OrchestrationResult<()> {
    if request.tasks.is_empty() {
        return Err(OrchestrationError::InvalidRequest(
            "request contains no tasks".to_string(),
        ));
    }
    if request.max_parallel == 0 {
        return Err(OrchestrationError::InvalidRequest(
            "max_parallel must be greater than 0".to_string(),
        ));
    }
    if let Some(cost) = request.global_budget.max_cost_units {
        if !cost.is_finite() || cost < 0.0 {
            return Err(OrchestrationError::InvalidRequest(format!(
                "global max_cost_units must be finite and non-negative, got {cost}"
            )));
        }
    }

    let mut seen = HashSet::with_capacity(request.tasks.len());
    for task in &request.tasks {
        if task.id.is_empty() {
            return Err(OrchestrationError::InvalidRequest(
                "task id must not be empty".to_string(),
            ));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(OrchestrationError::InvalidRequest(format!(
                "duplicate task id {}",
                task.id
            )));
        }
        if let Some(cost) = task.budget.max_cost_units {
            if !cost.is_finite() || cost < 0.0 {
                return Err(OrchestrationError::InvalidRequest(format!(
                    "task {} max_cost_units must be finite and non-negative, got {cost}",
                    task.id
                )));
            }
        }
    }
    Ok(())
}

/// Assembles an `Orchestrator` from its collaborators
pub struct OrchestratorBuilder {
    executor: Arc<dyn TaskExecutor>,
    classifier: Arc<dyn ErrorClassifier>,
    breakers: Arc<CircuitBreakerRegistry>,
    policy: RetryPolicy,
    idempotency: IdempotencyConfig,
    task_store: Option<Arc<IdempotencyStore<TaskResult>>>,
    events: EventPublisher,
}

impl OrchestratorBuilder {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            executor,
            classifier: Arc::new(StandardErrorClassifier::new()),
            breakers: Arc::new(CircuitBreakerRegistry::default()),
            policy: RetryPolicy::default(),
            idempotency: IdempotencyConfig::default(),
            task_store: None,
            events: EventPublisher::default(),
        }
    }

    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Share a breaker registry, e.g. across orchestrators hitting the same endpoints
    pub fn breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn idempotency(mut self, config: IdempotencyConfig) -> Self {
        self.idempotency = config;
        self
    }

    /// Share a task-level idempotency store across orchestrators
    pub fn task_store(mut self, store: Arc<IdempotencyStore<TaskResult>>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Orchestrator {
        let retry_manager =
            RetryManager::new(self.classifier, self.breakers).with_events(self.events.clone());
        let task_store = self
            .task_store
            .unwrap_or_else(|| Arc::new(IdempotencyStore::new(self.idempotency.clone())));

        Orchestrator {
            runner: TaskRunner {
                executor: self.executor,
                retry_manager: Arc::new(retry_manager),
                policy: Arc::new(self.policy),
                task_store,
                events: self.events,
            },
            request_store: Arc::new(IdempotencyStore::new(self.idempotency)),
        }
    }
}

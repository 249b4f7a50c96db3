//! # Orchestration Data Model
//!
//! Tasks, per-task results, and the request/output envelopes of one
//! orchestration run. A `Task` is immutable once submitted; a `TaskResult` is
//! created exactly once per task and never mutated afterwards.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::time::Duration;
use uuid::Uuid;

use super::error_classifier::ErrorCategory;
use crate::constants::{system, OrchestrationStatus, TaskStatus};

/// Resource usage reported by an executor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_units: f64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64, cost_units: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost_units,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cost_units == 0.0
    }
}

/// Token counts come from executors unchecked, so sums saturate
impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens.saturating_add(rhs.input_tokens),
            output_tokens: self.output_tokens.saturating_add(rhs.output_tokens),
            cost_units: self.cost_units + rhs.cost_units,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

impl Sum for Usage {
    fn sum<I: Iterator<Item = Usage>>(iter: I) -> Usage {
        iter.fold(Usage::default(), Add::add)
    }
}

/// Per-task ceiling; absent limits are unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBudget {
    pub max_duration: Option<Duration>,
    pub max_cost_units: Option<f64>,
}

/// One unit of work submitted to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub payload: Value,
    pub budget: TaskBudget,
    /// Higher priorities are admitted first; equal priorities keep submission order
    pub priority: i32,
    /// Circuit breaker scope for this task's endpoint
    pub endpoint_key: String,
    /// Caller-supplied deduplication key
    pub idempotency_key: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            budget: TaskBudget::default(),
            priority: 0,
            endpoint_key: "default".to_string(),
            idempotency_key: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint_key: impl Into<String>) -> Self {
        self.endpoint_key = endpoint_key.into();
        self
    }

    pub fn with_budget(mut self, budget: TaskBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Stable hash of the payload used for idempotency conflict detection
    pub fn payload_hash(&self) -> u64 {
        hash_values(std::iter::once(&self.payload))
    }
}

/// Hash a sequence of JSON values. Object keys serialize in sorted order,
/// so equal values always hash equally.
pub(crate) fn hash_values<'a, I>(values: I) -> u64
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut hasher = DefaultHasher::new();
    for value in values {
        value.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

/// A classified fault, as carried on a `TaskResult`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
    pub suggested_delay: Option<Duration>,
}

impl Fault {
    pub fn new(category: ErrorCategory, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            category,
            message: message.into(),
            retryable,
            suggested_delay: None,
        }
    }

    pub fn breaker_open(endpoint_key: &str, retry_in: Duration) -> Self {
        Self {
            category: ErrorCategory::BreakerOpen,
            message: format!("Circuit breaker is open for {endpoint_key}"),
            retryable: true,
            suggested_delay: Some(retry_in),
        }
    }

    pub fn budget_exceeded(reason: impl Into<String>) -> Self {
        Self::new(ErrorCategory::BudgetExceeded, reason, false)
    }

    pub fn conflict(key: &str) -> Self {
        Self::new(
            ErrorCategory::Conflict,
            format!("Idempotency key {key} was first used with a different payload"),
            false,
        )
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

/// Final record of one task's execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub usage: Usage,
    pub error: Option<Fault>,
    pub attempts: u32,
    pub duration: Duration,
    /// Served from the idempotency store without re-execution
    pub replayed: bool,
}

impl TaskResult {
    pub fn succeeded(
        task_id: impl Into<String>,
        output: Value,
        usage: Usage,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Succeeded,
            output: Some(output),
            usage,
            error: None,
            attempts,
            duration,
            replayed: false,
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        error: Fault,
        usage: Usage,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            output: None,
            usage,
            error: Some(error),
            attempts,
            duration,
            replayed: false,
        }
    }

    pub fn cancelled(
        task_id: impl Into<String>,
        reason: Fault,
        usage: Usage,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Cancelled,
            output: None,
            usage,
            error: Some(reason),
            attempts,
            duration,
            replayed: false,
        }
    }

    /// A prior result served again for a new submission of the same key
    pub fn replay_for(&self, task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            replayed: true,
            duration: Duration::ZERO,
            ..self.clone()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Request-wide ceiling polled by the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalBudget {
    pub max_duration: Option<Duration>,
    pub max_cost_units: Option<f64>,
}

impl GlobalBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub tasks: Vec<Task>,
    pub max_parallel: usize,
    pub global_budget: GlobalBudget,
    pub deterministic_seed: Option<u64>,
    pub idempotency_key: Option<String>,
}

impl OrchestrationRequest {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks,
            max_parallel: system::DEFAULT_MAX_PARALLEL,
            global_budget: GlobalBudget::unlimited(),
            deterministic_seed: None,
            idempotency_key: None,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_global_budget(mut self, budget: GlobalBudget) -> Self {
        self.global_budget = budget;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.deterministic_seed = Some(seed);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Hash over every task id and payload, for request-level deduplication
    pub fn payload_hash(&self) -> u64 {
        let ids: Vec<Value> = self
            .tasks
            .iter()
            .map(|task| Value::String(task.id.clone()))
            .collect();
        hash_values(
            ids.iter()
                .zip(self.tasks.iter())
                .flat_map(|(id, task)| [id, &task.payload]),
        )
    }
}

/// A task-level error surfaced on the aggregate output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub task_id: String,
    pub error: Fault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationOutput {
    pub run_id: Uuid,
    /// One entry per submitted task, in submission order
    pub results: Vec<TaskResult>,
    pub usage_total: Usage,
    pub cost_total: f64,
    pub elapsed: Duration,
    pub status: OrchestrationStatus,
    pub errors: Vec<TaskError>,
}

impl OrchestrationOutput {
    /// Aggregate per-task results into the run output. Replayed results
    /// contribute no usage because nothing was spent on them in this run.
    pub fn from_results(run_id: Uuid, results: Vec<TaskResult>, elapsed: Duration) -> Self {
        let usage_total: Usage = results
            .iter()
            .filter(|result| !result.replayed)
            .map(|result| result.usage)
            .sum();
        let status = OrchestrationStatus::from_task_statuses(results.iter().map(|r| r.status));
        let errors = results
            .iter()
            .filter_map(|result| {
                result.error.as_ref().map(|error| TaskError {
                    task_id: result.task_id.clone(),
                    error: error.clone(),
                })
            })
            .collect();

        Self {
            run_id,
            results,
            usage_total,
            cost_total: usage_total.cost_units,
            elapsed,
            status,
            errors,
        }
    }

    pub fn succeeded_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn result_for(&self, task_id: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.task_id == task_id)
    }
}

//! # Orchestration
//!
//! The scatter/gather core: the task data model, fault classification, the
//! bounded retry loop, global budget tracking, and the `Orchestrator` that
//! ties them together.
//!
//! ## Flow
//!
//! ```text
//! Orchestrator::run(request)
//!   └─ per task (admitted under max_parallel, highest priority first)
//!        ├─ IdempotencyStore::get_or_begin
//!        └─ RetryManager::execute_with_context
//!             ├─ CircuitBreaker::try_acquire
//!             ├─ TaskExecutor::execute
//!             └─ ErrorClassifier::classify
//! ```
//!
//! Every per-task outcome, including faults, is a `TaskResult`; only a
//! malformed or conflicting request surfaces as an `Err`.

pub mod budget;
pub mod error_classifier;
pub mod orchestrator;
pub mod retry;
pub mod types;

pub use budget::{BudgetTracker, CancelReason};
pub use error_classifier::{
    ErrorCategory, ErrorClassification, ErrorClassifier, ErrorClassifierConfig,
    StandardErrorClassifier,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use retry::{RetryContext, RetryManager, RetryPolicy, RetryState};
pub use types::{
    Fault, GlobalBudget, OrchestrationOutput, OrchestrationRequest, Task, TaskBudget, TaskError,
    TaskResult, Usage,
};

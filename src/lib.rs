#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Scatter Core
//!
//! Scatter/gather scheduling for slow, unreliable remote inference endpoints.
//!
//! ## Overview
//!
//! Many concurrent calls to flaky endpoints go in; one reliable outcome comes
//! out. Each task runs under a parallelism cap and per-task and global
//! budgets, through bounded retry and a per-endpoint circuit breaker, with
//! best-effort deduplication of repeated submissions. An optional replicated
//! mode runs one task K times and reduces the replicas to a consensus
//! summary, stopping early when the first two agree.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - Task model, error classifier, retry manager, orchestrator
//! - [`resilience`] - Per-endpoint circuit breakers and their registry
//! - [`idempotency`] - In-memory deduplication store
//! - [`replication`] - Replicated execution and evidence bundles
//! - [`execution`] - The task executor contract
//! - [`events`] - Per-task streaming events
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scatter_core::execution::TaskExecutor;
//! use scatter_core::orchestration::{OrchestrationRequest, Orchestrator, Task};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example(executor: Arc<dyn TaskExecutor>) -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::new(executor);
//! let request = OrchestrationRequest::new(vec![
//!     Task::new("summarize-1", json!({"doc": 1})).with_endpoint("vendor-a"),
//!     Task::new("summarize-2", json!({"doc": 2})).with_endpoint("vendor-a"),
//! ])
//! .with_max_parallel(2);
//!
//! let output = orchestrator.run(request).await?;
//! println!("{} of {} succeeded", output.succeeded_count(), output.results.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod execution;
pub mod idempotency;
pub mod logging;
pub mod orchestration;
pub mod replication;
pub mod resilience;

pub use config::{ConfigManager, ScatterConfig};
pub use constants::{OrchestrationStatus, TaskStatus};
pub use error::{OrchestrationError, OrchestrationResult};
pub use events::{EventPublisher, TaskEvent};
pub use execution::{ExecutionContext, ExecutionError, ExecutionOutput, TaskExecutor};
pub use idempotency::{IdempotencyOutcome, IdempotencyStore};
pub use orchestration::{
    ErrorCategory, Fault, GlobalBudget, OrchestrationOutput, OrchestrationRequest, Orchestrator,
    RetryManager, RetryPolicy, Task, TaskBudget, TaskResult, Usage,
};
pub use replication::{EvidenceBundle, ReplicationBarrier};
pub use resilience::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};

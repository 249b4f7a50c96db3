use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::{EventPublisher, TaskEvent};
use crate::orchestration::{ErrorCategory, Usage};

/// Transport family of an endpoint; shapes how faults are classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Remote endpoint reached over HTTP; status codes are authoritative
    Http,
    /// Local process or in-process model; only messages and flags are meaningful
    Local,
}

/// Successful result of one executor call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub output: Value,
    pub usage: Usage,
}

impl ExecutionOutput {
    pub fn new(output: Value, usage: Usage) -> Self {
        Self { output, usage }
    }
}

/// A raw fault raised by an executor, before classification
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    /// Status-code-like discriminator (HTTP status for HTTP endpoints)
    pub status_code: Option<u16>,
    /// Explicit retryability flag; overrides category policy when set
    pub retryable: Option<bool>,
    /// Provider-suggested delay before the next attempt
    pub retry_after: Option<Duration>,
    /// Category asserted by the executor itself
    pub category: Option<ErrorCategory>,
    /// Usage consumed before the failure, if known
    pub usage: Usage,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
            retryable: None,
            retry_after: None,
            category: None,
            usage: Usage::default(),
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Emits `on_progress` / `on_usage` events on behalf of a running task
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: String,
    publisher: Option<EventPublisher>,
}

impl ProgressReporter {
    pub fn new(task_id: impl Into<String>, publisher: Option<EventPublisher>) -> Self {
        Self {
            task_id: task_id.into(),
            publisher,
        }
    }

    /// A reporter that discards everything
    pub fn disabled(task_id: impl Into<String>) -> Self {
        Self::new(task_id, None)
    }

    pub fn progress(&self, delta: Value) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(TaskEvent::Progress {
                task_id: self.task_id.clone(),
                delta,
            });
        }
    }

    pub fn usage(&self, usage: Usage, is_estimated: bool) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(TaskEvent::Usage {
                task_id: self.task_id.clone(),
                usage,
                is_estimated,
            });
        }
    }
}

/// Everything an executor needs to run one attempt
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Cooperative deadline for this attempt
    pub deadline: Option<Instant>,
    /// Per-task seed, when the request is deterministic
    pub seed: Option<u64>,
    /// Observed at a safe point; never used to abort a committed side effect
    pub cancellation: CancellationToken,
    pub progress: ProgressReporter,
}

impl ExecutionContext {
    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Performs one unit of work against a remote endpoint
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute a single attempt. Must honor `context.deadline` and
    /// `context.cancellation` cooperatively and must not retry internally.
    async fn execute(
        &self,
        payload: &Value,
        context: &ExecutionContext,
    ) -> Result<ExecutionOutput, ExecutionError>;

    /// Transport family used when classifying this executor's faults
    fn endpoint_kind(&self) -> EndpointKind {
        EndpointKind::Http
    }
}

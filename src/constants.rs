//! # System Constants
//!
//! Core status enums and defaults that define the operational boundaries of
//! the scatter/gather scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Streaming event names, tagged by the source task id when emitted
pub mod events {
    pub const TASK_START: &str = "on_start";
    pub const TASK_PROGRESS: &str = "on_progress";
    pub const TASK_USAGE: &str = "on_usage";
    pub const TASK_COMPLETE: &str = "on_complete";
    pub const TASK_ERROR: &str = "on_error";
}

/// Final status of a single task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Succeeded)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Aggregate status of an orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    /// Every task succeeded
    Succeeded,
    /// At least one task succeeded and at least one did not
    Partial,
    /// No task succeeded
    Failed,
}

impl OrchestrationStatus {
    /// Derive the aggregate status from per-task statuses
    pub fn from_task_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        let mut total = 0usize;
        let mut succeeded = 0usize;
        for status in statuses {
            total += 1;
            if status.is_success() {
                succeeded += 1;
            }
        }

        if total > 0 && succeeded == total {
            OrchestrationStatus::Succeeded
        } else if succeeded > 0 {
            OrchestrationStatus::Partial
        } else {
            OrchestrationStatus::Failed
        }
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationStatus::Succeeded => write!(f, "succeeded"),
            OrchestrationStatus::Partial => write!(f, "partial"),
            OrchestrationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// System-wide defaults used when configuration omits a value
pub mod system {
    pub const DEFAULT_MAX_PARALLEL: usize = 8;
    pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
    pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
    pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
    pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
    pub const DEFAULT_COOLDOWN_MS: u64 = 30_000;
    pub const DEFAULT_HALF_OPEN_PROBE_LIMIT: u32 = 1;

    pub const DEFAULT_IDEMPOTENCY_TTL_SECONDS: u64 = 3_600;
    pub const DEFAULT_PENDING_WAIT_MS: u64 = 30_000;
    pub const DEFAULT_PENDING_TIMEOUT_MS: u64 = 300_000;

    pub const DEFAULT_REPLICATION_K: usize = 3;
    pub const DEFAULT_REPLICATION_EPSILON: f64 = 0.1;
    pub const DEFAULT_MAX_FIELDS: usize = 64;
    pub const DEFAULT_MAX_DIFFS: usize = 32;
    pub const DEFAULT_MAX_BYTES: usize = 64 * 1024;
}

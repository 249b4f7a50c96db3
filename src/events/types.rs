//! Streaming event schema.
//!
//! Events are tagged by the source task id. Events from one task are
//! published in order; events from different tasks interleave freely.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::constants::events;
use crate::orchestration::{ErrorCategory, Fault, Usage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum TaskEvent {
    #[serde(rename = "on_start")]
    Start { task_id: String },
    #[serde(rename = "on_progress")]
    Progress { task_id: String, delta: Value },
    #[serde(rename = "on_usage")]
    Usage {
        task_id: String,
        usage: Usage,
        is_estimated: bool,
    },
    #[serde(rename = "on_complete")]
    Complete {
        task_id: String,
        duration: Duration,
        usage: Usage,
    },
    #[serde(rename = "on_error")]
    Error { task_id: String, error: EventError },
}

/// Error payload carried by `on_error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventError {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
}

impl From<&Fault> for EventError {
    fn from(fault: &Fault) -> Self {
        Self {
            category: fault.category,
            message: fault.message.clone(),
            retryable: fault.retryable,
        }
    }
}

impl TaskEvent {
    /// Source task of this event
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Start { task_id }
            | TaskEvent::Progress { task_id, .. }
            | TaskEvent::Usage { task_id, .. }
            | TaskEvent::Complete { task_id, .. }
            | TaskEvent::Error { task_id, .. } => task_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Start { .. } => events::TASK_START,
            TaskEvent::Progress { .. } => events::TASK_PROGRESS,
            TaskEvent::Usage { .. } => events::TASK_USAGE,
            TaskEvent::Complete { .. } => events::TASK_COMPLETE,
            TaskEvent::Error { .. } => events::TASK_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_names() {
        let event = TaskEvent::Start {
            task_id: "t-1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "on_start");
        assert_eq!(json["task_id"], "t-1");
        assert_eq!(event.name(), events::TASK_START);

        let event = TaskEvent::Error {
            task_id: "t-2".to_string(),
            error: EventError {
                category: ErrorCategory::RateLimit,
                message: "slow down".to_string(),
                retryable: true,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "on_error");
        assert_eq!(json["error"]["category"], "rate_limit");
        assert_eq!(event.task_id(), "t-2");
    }
}

//! Request-level error types.
//!
//! Per-task failures never surface here: they travel inside
//! [`TaskResult`](crate::orchestration::TaskResult) as a
//! [`Fault`](crate::orchestration::Fault). These variants cover the cases
//! where a whole request is rejected before any task starts.

use crate::config::ConfigurationError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestrationError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Idempotency conflict for key {key}: payload differs from the original submission")]
    IdempotencyConflict { key: String },
    #[error("Idempotency key {key} is still being processed by another submission")]
    IdempotencyPending { key: String },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ConfigurationError> for OrchestrationError {
    fn from(error: ConfigurationError) -> Self {
        OrchestrationError::Configuration(error.to_string())
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(error: serde_json::Error) -> Self {
        OrchestrationError::InvalidRequest(format!("JSON serialization error: {error}"))
    }
}

pub type OrchestrationResult<T> = std::result::Result<T, OrchestrationError>;

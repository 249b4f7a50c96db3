//! # Executor Fault Classification
//!
//! Maps a raw [`ExecutionError`] to a closed [`ErrorCategory`] plus a default
//! retryability and backoff hint. This is the single source of truth for
//! retry and circuit-breaker eligibility: the retry manager and the breaker
//! both act on the category produced here and never re-derive it.
//!
//! ## Classification order
//!
//! ```text
//! ┌──────────────────┐   ┌───────────────────┐   ┌──────────────────┐   ┌─────────┐
//! │ executor-asserted│──▶│ status code (HTTP)│──▶│ message substring│──▶│ unknown │
//! │ category         │   │ + overrides       │   │ patterns         │   │         │
//! └──────────────────┘   └───────────────────┘   └──────────────────┘   └─────────┘
//! ```
//!
//! The first stage that produces a category wins. Classification never
//! panics; anything unrecognized is `unknown` and not retryable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::execution::{EndpointKind, ExecutionError};

/// Fault taxonomy shared by every component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Credentials rejected or missing; never retried
    Auth,
    /// Provider throttling; retried with backoff
    RateLimit,
    /// Request rejected as malformed; never retried
    Validation,
    /// Provider-side failure
    ServerError,
    /// Transport failure before a response was produced
    Network,
    /// Attempt exceeded its deadline
    Timeout,
    /// Call rejected locally by an open circuit breaker
    BreakerOpen,
    /// Idempotency key reused with a different payload
    Conflict,
    /// Task or request budget exhausted
    BudgetExceeded,
    /// Unrecognized fault; conservatively not retried
    Unknown,
}

impl ErrorCategory {
    /// Categories retried by the default policy
    pub fn default_retryable() -> &'static [ErrorCategory] {
        &[
            ErrorCategory::RateLimit,
            ErrorCategory::ServerError,
            ErrorCategory::Network,
            ErrorCategory::Timeout,
            ErrorCategory::BreakerOpen,
        ]
    }

    pub fn is_retryable_by_default(&self) -> bool {
        Self::default_retryable().contains(self)
    }

    /// Whether a fault of this category reflects endpoint health and should
    /// be recorded as a failure on the endpoint's circuit breaker
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimit
                | ErrorCategory::ServerError
                | ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Unknown
        )
    }

    /// Orchestration-level categories never reach the retry manager or breaker
    pub fn is_orchestration_level(&self) -> bool {
        matches!(self, ErrorCategory::Conflict | ErrorCategory::BudgetExceeded)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Validation => "validation",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::BreakerOpen => "breaker_open",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::BudgetExceeded => "budget_exceeded",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Result of error classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub is_retryable: bool,
    /// Provider-suggested delay, when the fault carried one
    pub suggested_delay: Option<Duration>,
}

/// Trait for error classification strategies
pub trait ErrorClassifier: Send + Sync {
    /// Classify a raw executor fault. Must never panic.
    fn classify(&self, error: &ExecutionError, endpoint_kind: EndpointKind) -> ErrorClassification;

    /// Get the classifier name for identification
    fn classifier_name(&self) -> &'static str;
}

/// Configuration for classification behavior
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifierConfig {
    /// Vendor-specific status codes mapped to a category ahead of the
    /// built-in status table
    pub status_overrides: HashMap<u16, ErrorCategory>,
}

/// Standard classifier: asserted category, then status code, then message
#[derive(Debug, Clone, Default)]
pub struct StandardErrorClassifier {
    config: ErrorClassifierConfig,
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota",
    "throttl",
];
const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "forbidden",
    "invalid api key",
    "invalid_api_key",
    "authentication",
    "permission denied",
];
const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline exceeded"];
const NETWORK_PATTERNS: &[&str] = &[
    "connection",
    "network",
    "dns",
    "reset by peer",
    "broken pipe",
    "unreachable",
    "unexpected eof",
];
const BREAKER_PATTERNS: &[&str] = &["circuit breaker", "breaker open"];
const SERVER_PATTERNS: &[&str] = &[
    "internal server error",
    "server error",
    "service unavailable",
    "bad gateway",
    "overloaded",
    "upstream",
];
const VALIDATION_PATTERNS: &[&str] = &[
    "invalid",
    "validation",
    "bad request",
    "malformed",
    "unprocessable",
    "schema",
];

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ErrorClassifierConfig) -> Self {
        Self { config }
    }

    fn classify_status(&self, status: u16) -> Option<ErrorCategory> {
        if let Some(category) = self.config.status_overrides.get(&status) {
            return Some(*category);
        }

        match status {
            401 | 403 => Some(ErrorCategory::Auth),
            408 => Some(ErrorCategory::Timeout),
            429 => Some(ErrorCategory::RateLimit),
            400 | 404 | 405 | 409 | 413 | 415 | 422 => Some(ErrorCategory::Validation),
            504 => Some(ErrorCategory::Timeout),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => None,
        }
    }

    fn classify_message(message: &str) -> Option<ErrorCategory> {
        let message = message.to_lowercase();
        let matches = |patterns: &[&str]| patterns.iter().any(|p| message.contains(p));

        // Order matters: "invalid api key" is auth, "connection timed out" is a timeout
        if matches(BREAKER_PATTERNS) {
            Some(ErrorCategory::BreakerOpen)
        } else if matches(RATE_LIMIT_PATTERNS) {
            Some(ErrorCategory::RateLimit)
        } else if matches(AUTH_PATTERNS) {
            Some(ErrorCategory::Auth)
        } else if matches(TIMEOUT_PATTERNS) {
            Some(ErrorCategory::Timeout)
        } else if matches(NETWORK_PATTERNS) {
            Some(ErrorCategory::Network)
        } else if matches(SERVER_PATTERNS) {
            Some(ErrorCategory::ServerError)
        } else if matches(VALIDATION_PATTERNS) {
            Some(ErrorCategory::Validation)
        } else {
            None
        }
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify(&self, error: &ExecutionError, endpoint_kind: EndpointKind) -> ErrorClassification {
        let from_status = match (endpoint_kind, error.status_code) {
            (EndpointKind::Http, Some(status)) => self.classify_status(status),
            _ => None,
        };

        let category = error
            .category
            .or(from_status)
            .or_else(|| Self::classify_message(&error.message))
            .unwrap_or(ErrorCategory::Unknown);

        ErrorClassification {
            category,
            is_retryable: category.is_retryable_by_default(),
            suggested_delay: error.retry_after,
        }
    }

    fn classifier_name(&self) -> &'static str {
        "StandardErrorClassifier"
    }
}

//! # Scatter Configuration System
//!
//! Layered configuration for the scheduler. Every section has working
//! defaults, so `ScatterConfig::default()` is a valid configuration and a
//! config file only needs to name what it overrides.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use scatter_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let policy = manager.config().retry.to_retry_policy();
//! let max_parallel = manager.config().orchestration.max_parallel;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::constants::system;
use crate::idempotency::{IdempotencyConfig, PendingPolicy};
use crate::orchestration::{ErrorCategory, GlobalBudget, RetryPolicy};
use crate::resilience::CircuitBreakerConfig as BreakerSettings;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring scatter.toml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScatterConfig {
    /// Concurrency cap and request-wide budget
    pub orchestration: OrchestrationConfig,

    /// Backoff and retry configuration
    pub retry: RetryConfig,

    /// Circuit breaker configuration for resilience patterns
    pub circuit_breakers: CircuitBreakerConfig,

    /// Deduplication window
    pub idempotency: IdempotencyStoreConfig,

    /// Replicated execution and evidence bundle caps
    pub replication: ReplicationConfig,
}

impl ScatterConfig {
    /// Validate every section, returning the first failure
    pub fn validate(&self) -> ConfigResult<()> {
        self.orchestration.validate()?;
        self.retry.validate()?;
        self.circuit_breakers.validate()?;
        self.idempotency.validate()?;
        self.replication.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub max_parallel: usize,
    pub global_budget: GlobalBudgetConfig,
    pub event_channel_capacity: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_parallel: system::DEFAULT_MAX_PARALLEL,
            global_budget: GlobalBudgetConfig::default(),
            event_channel_capacity: system::DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl OrchestrationConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_parallel == 0 {
            return Err(ConfigurationError::invalid_value(
                "orchestration.max_parallel",
                self.max_parallel,
                "must be greater than 0",
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "orchestration.event_channel_capacity",
                self.event_channel_capacity,
                "must be greater than 0",
            ));
        }
        self.global_budget.validate()
    }
}

/// Request-wide ceiling; absent limits are unbounded
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalBudgetConfig {
    pub max_duration_ms: Option<u64>,
    pub max_cost_units: Option<f64>,
}

impl GlobalBudgetConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(cost) = self.max_cost_units {
            if !cost.is_finite() || cost < 0.0 {
                return Err(ConfigurationError::invalid_value(
                    "orchestration.global_budget.max_cost_units",
                    cost,
                    "must be a finite, non-negative number",
                ));
            }
        }
        Ok(())
    }

    pub fn to_global_budget(&self) -> GlobalBudget {
        GlobalBudget {
            max_duration: self.max_duration_ms.map(Duration::from_millis),
            max_cost_units: self.max_cost_units,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_factor: f64,
    pub retry_on: Vec<ErrorCategory>,
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: system::DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: system::DEFAULT_BASE_DELAY_MS,
            max_delay_ms: system::DEFAULT_MAX_DELAY_MS,
            backoff_factor: system::DEFAULT_BACKOFF_FACTOR,
            jitter_factor: system::DEFAULT_JITTER_FACTOR,
            retry_on: ErrorCategory::default_retryable().to_vec(),
            respect_retry_after: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        self.to_retry_policy()
            .validate()
            .map_err(|reason| ConfigurationError::invalid_value("retry", format!("{self:?}"), reason))
    }

    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
            jitter_factor: self.jitter_factor,
            retry_on: self.retry_on.iter().copied().collect(),
            respect_retry_after: self.respect_retry_after,
        }
    }
}

/// Circuit breaker configuration with per-endpoint overrides
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub default_config: CircuitBreakerComponentConfig,
    pub endpoints: HashMap<String, CircuitBreakerComponentConfig>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_config: CircuitBreakerComponentConfig::default(),
            endpoints: HashMap::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Configuration for an endpoint, falling back to the default
    pub fn config_for_endpoint(&self, endpoint_key: &str) -> &CircuitBreakerComponentConfig {
        self.endpoints
            .get(endpoint_key)
            .unwrap_or(&self.default_config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let sections = std::iter::once(("default_config", &self.default_config))
            .chain(self.endpoints.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, component) in sections {
            component.to_resilience_config().validate().map_err(|reason| {
                ConfigurationError::invalid_value(
                    format!("circuit_breakers.{name}"),
                    format!("{component:?}"),
                    reason,
                )
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerComponentConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown_ms: u64,
    pub half_open_probe_limit: u32,
}

impl Default for CircuitBreakerComponentConfig {
    fn default() -> Self {
        Self {
            failure_threshold: system::DEFAULT_FAILURE_THRESHOLD,
            success_threshold: system::DEFAULT_SUCCESS_THRESHOLD,
            cooldown_ms: system::DEFAULT_COOLDOWN_MS,
            half_open_probe_limit: system::DEFAULT_HALF_OPEN_PROBE_LIMIT,
        }
    }
}

impl CircuitBreakerComponentConfig {
    pub fn to_resilience_config(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
            half_open_probe_limit: self.half_open_probe_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingPolicyKind {
    Wait,
    Reject,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdempotencyStoreConfig {
    pub ttl_seconds: u64,
    pub pending_policy: PendingPolicyKind,
    pub pending_wait_ms: u64,
    pub pending_timeout_ms: u64,
}

impl Default for IdempotencyStoreConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: system::DEFAULT_IDEMPOTENCY_TTL_SECONDS,
            pending_policy: PendingPolicyKind::Wait,
            pending_wait_ms: system::DEFAULT_PENDING_WAIT_MS,
            pending_timeout_ms: system::DEFAULT_PENDING_TIMEOUT_MS,
        }
    }
}

impl IdempotencyStoreConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.ttl_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "idempotency.ttl_seconds",
                self.ttl_seconds,
                "must be greater than 0",
            ));
        }
        if self.pending_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "idempotency.pending_timeout_ms",
                self.pending_timeout_ms,
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn to_idempotency_config(&self) -> IdempotencyConfig {
        let pending_policy = match self.pending_policy {
            PendingPolicyKind::Wait => PendingPolicy::Wait {
                max_wait: Duration::from_millis(self.pending_wait_ms),
            },
            PendingPolicyKind::Reject => PendingPolicy::Reject,
        };
        IdempotencyConfig {
            ttl: Duration::from_secs(self.ttl_seconds),
            pending_policy,
            pending_timeout: Duration::from_millis(self.pending_timeout_ms),
        }
    }
}

/// Replicated execution settings and evidence bundle size caps
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub k: usize,
    pub epsilon: f64,
    pub max_fields: usize,
    pub max_diffs: usize,
    pub max_bytes: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            k: system::DEFAULT_REPLICATION_K,
            epsilon: system::DEFAULT_REPLICATION_EPSILON,
            max_fields: system::DEFAULT_MAX_FIELDS,
            max_diffs: system::DEFAULT_MAX_DIFFS,
            max_bytes: system::DEFAULT_MAX_BYTES,
        }
    }
}

impl ReplicationConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.k == 0 {
            return Err(ConfigurationError::invalid_value(
                "replication.k",
                self.k,
                "must be at least 1",
            ));
        }
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(ConfigurationError::invalid_value(
                "replication.epsilon",
                self.epsilon,
                "must be a finite, non-negative number",
            ));
        }
        if self.max_fields == 0 || self.max_bytes == 0 {
            return Err(ConfigurationError::invalid_value(
                "replication.max_fields/max_bytes",
                format!("{}/{}", self.max_fields, self.max_bytes),
                "size caps must be greater than 0",
            ));
        }
        Ok(())
    }
}

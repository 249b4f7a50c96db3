//! # Circuit Breaker Configuration
//!
//! Runtime settings for a single endpoint's breaker. The file-backed,
//! per-endpoint configuration lives in `crate::config::CircuitBreakerConfig`
//! and converts into this type.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::system;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Number of consecutive half-open successes required to close circuit
    pub success_threshold: u32,

    /// Time to wait in open state before admitting probes
    pub cooldown: Duration,

    /// Maximum concurrent probe calls while half-open
    pub half_open_probe_limit: u32,
}

impl CircuitBreakerConfig {
    /// Settings for remote inference endpoints that throttle aggressively
    pub fn for_rate_limited_endpoint() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            cooldown: Duration::from_secs(60),
            half_open_probe_limit: 1,
        }
    }

    /// Settings for in-process or local model endpoints
    pub fn for_local_endpoint() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 2,
            cooldown: Duration::from_secs(5),
            half_open_probe_limit: 2,
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.cooldown.is_zero() {
            return Err("cooldown must be greater than 0".to_string());
        }

        if self.cooldown > Duration::from_secs(3600) {
            return Err("cooldown should not exceed 3600 seconds".to_string());
        }

        if self.success_threshold == 0 {
            return Err("success_threshold must be greater than 0".to_string());
        }

        if self.half_open_probe_limit == 0 {
            return Err("half_open_probe_limit must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: system::DEFAULT_FAILURE_THRESHOLD,
            success_threshold: system::DEFAULT_SUCCESS_THRESHOLD,
            cooldown: Duration::from_millis(system::DEFAULT_COOLDOWN_MS),
            half_open_probe_limit: system::DEFAULT_HALF_OPEN_PROBE_LIMIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(CircuitBreakerConfig::for_rate_limited_endpoint()
            .validate()
            .is_ok());
        assert!(CircuitBreakerConfig::for_local_endpoint().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let config = CircuitBreakerConfig {
            half_open_probe_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CircuitBreakerConfig {
            cooldown: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

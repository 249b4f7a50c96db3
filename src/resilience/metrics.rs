//! # Circuit Breaker Metrics
//!
//! Point-in-time snapshots of breaker counters for one endpoint, and the
//! registry view across every endpoint the orchestrator has called.

use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Below this many resolved calls a closed breaker counts as healthy
pub const HEALTH_MIN_CALLS: u64 = 10;

/// Failure rate at or above which a closed breaker counts as unhealthy
pub const HEALTH_MAX_FAILURE_RATE: f64 = 0.1;

/// Counters for one endpoint's breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls admitted and resolved with an outcome
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Calls rejected without reaching the executor
    pub rejected_count: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Probes currently admitted while half-open
    pub half_open_in_flight: u32,
    pub current_state: CircuitState,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub average_duration: Duration,
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }
}

impl CircuitBreakerMetrics {
    /// Closed, and either too few calls to judge or failing rarely
    pub fn is_healthy(&self) -> bool {
        self.current_state == CircuitState::Closed
            && (self.total_calls < HEALTH_MIN_CALLS
                || self.failure_rate < HEALTH_MAX_FAILURE_RATE)
    }
}

/// Breaker snapshots for every endpoint in a registry, keyed and ordered
/// by endpoint key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryMetrics {
    pub endpoints: BTreeMap<String, CircuitBreakerMetrics>,
    pub collected_at: chrono::DateTime<chrono::Utc>,
}

impl FromIterator<(String, CircuitBreakerMetrics)> for RegistryMetrics {
    fn from_iter<I: IntoIterator<Item = (String, CircuitBreakerMetrics)>>(iter: I) -> Self {
        Self {
            endpoints: iter.into_iter().collect(),
            collected_at: chrono::Utc::now(),
        }
    }
}

impl RegistryMetrics {
    pub fn count_in_state(&self, state: CircuitState) -> usize {
        self.endpoints
            .values()
            .filter(|metrics| metrics.current_state == state)
            .count()
    }

    pub fn unhealthy_endpoints(&self) -> Vec<&str> {
        self.endpoints
            .iter()
            .filter(|(_, metrics)| !metrics.is_healthy())
            .map(|(key, _)| key.as_str())
            .collect()
    }

    /// Share of endpoints that are healthy; 1.0 with no endpoints
    pub fn health_score(&self) -> f64 {
        if self.endpoints.is_empty() {
            return 1.0;
        }
        let unhealthy = self.unhealthy_endpoints().len();
        (self.endpoints.len() - unhealthy) as f64 / self.endpoints.len() as f64
    }

    pub fn total_calls(&self) -> u64 {
        self.endpoints.values().map(|m| m.total_calls).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.endpoints.values().map(|m| m.failure_count).sum()
    }

    pub fn total_rejections(&self) -> u64 {
        self.endpoints.values().map(|m| m.rejected_count).sum()
    }

    pub fn failure_rate(&self) -> f64 {
        match self.total_calls() {
            0 => 0.0,
            total => self.total_failures() as f64 / total as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_aggregation() {
        let vendor_a = CircuitBreakerMetrics {
            total_calls: 100,
            success_count: 95,
            failure_count: 5,
            failure_rate: 0.05,
            ..Default::default()
        };
        let vendor_b = CircuitBreakerMetrics {
            total_calls: 50,
            success_count: 25,
            failure_count: 25,
            rejected_count: 7,
            failure_rate: 0.5,
            current_state: CircuitState::Open,
            ..Default::default()
        };
        let metrics: RegistryMetrics = [
            ("vendor-b".to_string(), vendor_b),
            ("vendor-a".to_string(), vendor_a),
        ]
        .into_iter()
        .collect();

        assert_eq!(metrics.total_calls(), 150);
        assert_eq!(metrics.total_failures(), 30);
        assert_eq!(metrics.total_rejections(), 7);
        assert_eq!(metrics.failure_rate(), 0.2);
        assert_eq!(metrics.health_score(), 0.5);
        assert_eq!(metrics.unhealthy_endpoints(), vec!["vendor-b"]);
        assert_eq!(metrics.count_in_state(CircuitState::Closed), 1);
        assert_eq!(metrics.count_in_state(CircuitState::Open), 1);
        assert_eq!(metrics.count_in_state(CircuitState::HalfOpen), 0);
    }

    #[test]
    fn test_health_needs_enough_calls_to_judge() {
        let mut metrics = CircuitBreakerMetrics {
            total_calls: 4,
            failure_count: 2,
            failure_rate: 0.5,
            ..Default::default()
        };
        assert!(metrics.is_healthy());

        metrics.total_calls = HEALTH_MIN_CALLS;
        assert!(!metrics.is_healthy());

        metrics.failure_rate = 0.0;
        metrics.current_state = CircuitState::HalfOpen;
        assert!(!metrics.is_healthy());
    }

    #[test]
    fn test_empty_registry_is_healthy() {
        let metrics: RegistryMetrics = std::iter::empty().collect();
        assert_eq!(metrics.health_score(), 1.0);
        assert_eq!(metrics.failure_rate(), 0.0);
    }
}

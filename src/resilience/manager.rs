//! # Circuit Breaker Registry
//!
//! Process-wide map from endpoint key to its breaker. Each breaker carries
//! its own lock, so endpoints never contend with one another; the map itself
//! is sharded.

use crate::config::CircuitBreakerConfig as CircuitBreakerSettings;
use crate::resilience::{CircuitBreaker, CircuitBreakerMetrics, RegistryMetrics};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Registry of circuit breakers keyed by endpoint
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: CircuitBreakerSettings,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        info!(
            enabled = settings.enabled,
            endpoint_overrides = settings.endpoints.len(),
            "Initializing circuit breaker registry"
        );

        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    /// Whether breakers guard executor calls at all
    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Breaker for an endpoint, or `None` when breakers are disabled
    pub fn breaker_for(&self, endpoint_key: &str) -> Option<Arc<CircuitBreaker>> {
        self.is_enabled().then(|| self.get_or_create(endpoint_key))
    }

    /// Get or create the circuit breaker for an endpoint
    pub fn get_or_create(&self, endpoint_key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(endpoint_key) {
            return Arc::clone(breaker.value());
        }

        let breaker = match self.breakers.entry(endpoint_key.to_string()) {
            Entry::Occupied(entry) => return Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let config = self
                    .settings
                    .config_for_endpoint(endpoint_key)
                    .to_resilience_config();
                let breaker = Arc::new(CircuitBreaker::new(endpoint_key, config));
                entry.insert(Arc::clone(&breaker));
                breaker
            }
        };

        info!(
            endpoint_key = endpoint_key,
            total_circuit_breakers = self.breakers.len(),
            "Created circuit breaker"
        );

        breaker
    }

    /// Existing breaker for an endpoint, if one has been created
    pub fn get(&self, endpoint_key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(endpoint_key)
            .map(|breaker| Arc::clone(breaker.value()))
    }

    /// Endpoint keys with a breaker, sorted
    pub fn list_endpoints(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn endpoint_metrics(&self, endpoint_key: &str) -> Option<CircuitBreakerMetrics> {
        self.breakers
            .get(endpoint_key)
            .map(|breaker| breaker.metrics())
    }

    /// Snapshot of every endpoint's breaker
    pub fn system_metrics(&self) -> RegistryMetrics {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect()
    }

    /// Force open all circuit breakers
    pub fn force_open_all(&self) {
        warn!("Forcing all circuit breakers open");
        for entry in self.breakers.iter() {
            entry.value().force_open();
        }
    }

    /// Force close all circuit breakers
    pub fn force_close_all(&self) {
        warn!("Forcing all circuit breakers closed");
        for entry in self.breakers.iter() {
            entry.value().force_closed();
        }
    }

    /// Remove the circuit breaker for an endpoint
    pub fn remove(&self, endpoint_key: &str) -> bool {
        if self.breakers.remove(endpoint_key).is_some() {
            info!(
                endpoint_key = endpoint_key,
                remaining_count = self.breakers.len(),
                "Removed circuit breaker"
            );
            true
        } else {
            false
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerSettings::default())
    }
}

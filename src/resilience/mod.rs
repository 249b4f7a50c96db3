//! # Resilience Module
//!
//! Per-endpoint circuit breaking for remote inference calls. A failing
//! endpoint is isolated for a cooldown window so that retries and sibling
//! tasks stop hammering it, then probed before traffic resumes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use scatter_core::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     success_threshold: 2,
//!     cooldown: Duration::from_secs(30),
//!     half_open_probe_limit: 1,
//! };
//!
//! let breaker = CircuitBreaker::new("vendor-a", config);
//!
//! let result = breaker.call(|| async {
//!     Ok::<&str, Box<dyn std::error::Error>>("success")
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;

pub use circuit_breaker::{
    BreakerRejection, CallPermit, CircuitBreaker, CircuitBreakerError, CircuitState,
};
pub use config::CircuitBreakerConfig;
pub use manager::CircuitBreakerRegistry;
pub use metrics::{CircuitBreakerMetrics, RegistryMetrics};

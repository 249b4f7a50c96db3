//! Loading the shipped configuration files and building from them

mod common;

use common::*;
use scatter_core::config::{ConfigManager, ScatterConfig};
use scatter_core::idempotency::PendingPolicy;
use scatter_core::orchestration::{OrchestrationRequest, Orchestrator, Task};
use scatter_core::OrchestrationError;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn shipped_config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config")
}

fn load(environment: &str) -> Arc<ConfigManager> {
    ConfigManager::load_with_env_source(
        Some(shipped_config_dir()),
        environment,
        Some(config::Map::new()),
    )
    .unwrap()
}

#[test]
fn test_base_config_matches_defaults() {
    let manager = load("development");
    let defaults = ScatterConfig::default();
    let config = manager.config();

    assert_eq!(config.orchestration.max_parallel, defaults.orchestration.max_parallel);
    assert_eq!(config.retry.max_attempts, defaults.retry.max_attempts);
    assert_eq!(config.retry.retry_on, defaults.retry.retry_on);
    assert_eq!(config.replication, defaults.replication);
    assert!(config.circuit_breakers.enabled);
}

#[test]
fn test_test_environment_shortens_timings() {
    let manager = load("test");
    let config = manager.config();

    assert_eq!(manager.environment(), "test");
    assert_eq!(config.retry.base_delay_ms, 10);
    assert_eq!(config.circuit_breakers.default_config.failure_threshold, 3);

    let idempotency = config.idempotency.to_idempotency_config();
    assert_eq!(
        idempotency.pending_policy,
        PendingPolicy::Wait {
            max_wait: Duration::from_millis(1_000)
        }
    );
}

#[test]
fn test_production_environment_sets_global_budget() {
    let manager = load("production");
    let budget = manager.config().orchestration.global_budget.to_global_budget();

    assert_eq!(manager.config().orchestration.max_parallel, 32);
    assert_eq!(budget.max_duration, Some(Duration::from_secs(300)));
    assert_eq!(budget.max_cost_units, None);
}

#[test]
fn test_env_override_is_validated() {
    let mut env_source = config::Map::new();
    env_source.insert("SCATTER__ORCHESTRATION__MAX_PARALLEL".to_string(), "0".to_string());

    let result =
        ConfigManager::load_with_env_source(Some(shipped_config_dir()), "test", Some(env_source));
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_orchestrator_from_config() {
    let manager = load("test");
    let executor = Arc::new(ScriptedExecutor::new().with_behavior("t1", Behavior::FailTimes(1, network_error())));

    let orchestrator = Orchestrator::from_config(executor.clone(), manager.config())
        .unwrap()
        .build();
    assert_eq!(orchestrator.retry_policy().base_delay, Duration::from_millis(10));

    let output = orchestrator
        .run(OrchestrationRequest::new(vec![
            Task::new("t0", json!({})),
            Task::new("t1", json!({})),
        ]))
        .await
        .unwrap();

    assert_eq!(output.succeeded_count(), 2);
    assert_eq!(output.result_for("t1").unwrap().attempts, 2);
}

#[test]
fn test_invalid_config_is_rejected_by_orchestrator() {
    let mut config = ScatterConfig::default();
    config.replication.k = 0;

    let result = Orchestrator::from_config(Arc::new(ScriptedExecutor::new()), &config);
    assert!(matches!(result, Err(OrchestrationError::Configuration(_))));
}

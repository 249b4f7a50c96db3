//! Replicated execution with early stopping and evidence reduction

mod common;

use common::*;
use scatter_core::config::ReplicationConfig;
use scatter_core::orchestration::{GlobalBudget, Orchestrator, RetryPolicy, Task};
use scatter_core::replication::{FieldKind, FieldSchema, FieldSpec, ReplicationBarrier};
use serde_json::json;
use std::sync::Arc;

fn schema() -> FieldSchema {
    FieldSchema::new(vec![
        FieldSpec::required("label", FieldKind::String),
        FieldSpec::required("score", FieldKind::Number),
    ])
}

fn barrier(executor: Arc<ScriptedExecutor>, config: ReplicationConfig) -> ReplicationBarrier {
    let orchestrator = Orchestrator::builder(executor)
        .retry_policy(RetryPolicy::no_retry())
        .build();
    ReplicationBarrier::new(Arc::new(orchestrator), config)
}

fn scored(label: &str, score: f64) -> Behavior {
    Behavior::Output(json!({"label": label, "score": score}))
}

#[tokio::test]
async fn test_scenario_e_early_agreement_skips_remaining_replicas() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_behavior("q#r1", scored("cat", 1.0))
            .with_behavior("q#r2", scored("cat", 0.9))
            .with_behavior("q#r3", scored("dog", 0.1)),
    );
    let barrier = barrier(executor.clone(), ReplicationConfig::default());

    let bundle = barrier
        .replicate(&Task::new("q", json!({"image": 7})), 3, 0.1, &schema())
        .await
        .unwrap();

    assert_eq!(bundle.replicates.len(), 2);
    assert!(executor.calls_for("q#r3").is_empty());
    assert!(bundle.meta.early_stopped);
    assert_eq!(bundle.meta.requested_replicas, 3);
    assert_eq!(bundle.meta.completed_replicas, 2);
    let early = bundle.meta.early_distance.unwrap();
    assert!((early - 0.05).abs() < 1e-9, "early distance was {early}");
    assert!(!bundle.summary.truncated);

    let label = &bundle.summary.consensus[0];
    assert_eq!(label.field, "label");
    assert_eq!(label.value, json!("cat"));
    assert_eq!(label.support, 2);
    // No strict majority on score; the lower median is elected
    assert_eq!(bundle.summary.consensus[1].value, json!(0.9));
    assert_eq!(bundle.summary.disagreements.len(), 1);
    assert_eq!(bundle.summary.disagreements[0].field, "score");
    assert_eq!(bundle.meta.usage_total, CALL_USAGE + CALL_USAGE);
}

#[tokio::test]
async fn test_invalid_replicate_is_kept_at_maximum_distance() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_behavior("q#r1", scored("cat", 1.0))
            .with_behavior("q#r2", Behavior::Output(json!({"label": "cat"})))
            .with_behavior("q#r3", scored("cat", 1.0)),
    );
    let barrier = barrier(executor.clone(), ReplicationConfig::default());

    let bundle = barrier
        .replicate(&Task::new("q", json!({})), 3, 0.1, &schema())
        .await
        .unwrap();

    assert_eq!(bundle.replicates.len(), 3);
    assert!(!bundle.meta.early_stopped);
    let invalid = &bundle.replicates[1];
    assert!(!invalid.quality.valid);
    assert!(!invalid.quality.errors.is_empty());

    let matrix = &bundle.summary.pairwise_distance;
    assert_eq!(matrix[0][1], 1.0);
    assert_eq!(matrix[1][2], 1.0);
    assert_eq!(matrix[0][2], 0.0);
    // Consensus considers valid replicates only
    assert_eq!(bundle.summary.consensus[1].value, json!(1.0));
    assert_eq!(bundle.summary.consensus[1].support, 2);
    assert!(bundle.summary.disagreements.is_empty());
    assert!(bundle.summary.confidence < 1.0);
}

#[tokio::test]
async fn test_failed_replica_is_recorded_as_invalid() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_default(scored("cat", 2.0))
            .with_behavior("q#r2", Behavior::FailAlways(validation_error())),
    );
    let barrier = barrier(executor.clone(), ReplicationConfig::default());

    let bundle = barrier
        .replicate(&Task::new("q", json!({})), 3, 0.1, &schema())
        .await
        .unwrap();

    assert_eq!(bundle.replicates.len(), 3);
    let failed = &bundle.replicates[1];
    assert_eq!(failed.id, "q#r2");
    assert!(!failed.quality.valid);
    assert!(failed.quality.errors[0].contains("prompt exceeds schema"));
    assert_eq!(bundle.summary.consensus[0].value, json!("cat"));
}

#[tokio::test]
async fn test_distance_matrix_is_symmetric() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_behavior("q#r1", scored("cat", 1.0))
            .with_behavior("q#r2", scored("dog", 3.0))
            .with_behavior("q#r3", scored("cat", 2.0))
            .with_behavior("q#r4", scored("bird", 0.5)),
    );
    let barrier = barrier(executor, ReplicationConfig::default());

    let bundle = barrier
        .replicate(&Task::new("q", json!({})), 4, 0.1, &schema())
        .await
        .unwrap();

    let matrix = &bundle.summary.pairwise_distance;
    assert_eq!(matrix.len(), 4);
    for i in 0..4 {
        assert_eq!(matrix[i][i], 0.0);
        for j in 0..4 {
            assert_eq!(matrix[i][j], matrix[j][i]);
            assert!((0.0..=1.0).contains(&matrix[i][j]));
        }
    }
    let score = &bundle.summary.distributions[0];
    assert_eq!(score.field, "score");
    assert_eq!(score.count, 4);
    assert_eq!(score.min, 0.5);
    assert_eq!(score.max, 3.0);
}

#[tokio::test]
async fn test_replicas_receive_consecutive_seeds() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_behavior("q#r1", scored("cat", 1.0))
            .with_behavior("q#r2", scored("dog", 1.0))
            .with_behavior("q#r3", scored("cat", 1.0)),
    );
    let barrier = barrier(executor.clone(), ReplicationConfig::default()).with_seed(7);

    barrier
        .replicate(&Task::new("q", json!({})), 3, 0.1, &schema())
        .await
        .unwrap();

    for (id, seed) in [("q#r1", 7), ("q#r2", 8), ("q#r3", 9)] {
        assert_eq!(executor.calls_for(id)[0].seed, Some(seed), "seed for {id}");
    }
}

#[tokio::test]
async fn test_size_caps_mark_summary_truncated() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .with_behavior("q#r1", scored("cat", 1.0))
            .with_behavior("q#r2", scored("dog", 5.0)),
    );
    let config = ReplicationConfig {
        max_fields: 1,
        ..ReplicationConfig::default()
    };
    let barrier = barrier(executor, config);

    let bundle = barrier
        .replicate(&Task::new("q", json!({})), 2, 0.1, &schema())
        .await
        .unwrap();

    assert!(bundle.summary.truncated);
    assert_eq!(bundle.summary.consensus.len(), 1);
    assert_eq!(bundle.summary.pairwise_distance.len(), 2);
}

#[tokio::test]
async fn test_defaults_come_from_config() {
    let executor = Arc::new(ScriptedExecutor::new().with_default(scored("cat", 1.0)));
    let config = ReplicationConfig {
        k: 4,
        ..ReplicationConfig::default()
    };
    let barrier = barrier(executor.clone(), config);

    let bundle = barrier
        .replicate_with_defaults(&Task::new("q", json!({})), &schema())
        .await
        .unwrap();

    assert_eq!(bundle.meta.requested_replicas, 4);
    assert!(bundle.meta.early_stopped);
    assert_eq!(executor.call_count(), 2);
    assert_eq!(bundle.summary.confidence, 1.0);
}

fn disagreeing_executor() -> Arc<ScriptedExecutor> {
    Arc::new(
        ScriptedExecutor::new()
            .with_behavior("q#r1", scored("cat", 1.0))
            .with_behavior("q#r2", scored("dog", 0.2)),
    )
}

fn cost_cap(max_cost_units: f64) -> GlobalBudget {
    GlobalBudget {
        max_duration: None,
        max_cost_units: Some(max_cost_units),
    }
}

#[tokio::test]
async fn test_global_budget_spans_both_phases() {
    let executor = disagreeing_executor();
    let barrier = barrier(executor.clone(), ReplicationConfig::default())
        .with_global_budget(cost_cap(2.5))
        .with_max_parallel(1);

    let bundle = barrier
        .replicate(&Task::new("q", json!({})), 5, 0.1, &schema())
        .await
        .unwrap();

    // The early pair spends 2.0, so only one more replica fits under 2.5
    assert!(!bundle.meta.early_stopped);
    assert_eq!(executor.call_count(), 3);
    assert_eq!(bundle.meta.usage_total.cost_units, 3.0);
    assert_eq!(bundle.replicates.len(), 5);
    for skipped in &bundle.replicates[3..] {
        assert!(!skipped.quality.valid);
        assert!(skipped.quality.errors[0].contains("cost budget"));
    }
}

#[tokio::test]
async fn test_exhausted_budget_skips_remaining_phase() {
    let executor = disagreeing_executor();
    let barrier = barrier(executor.clone(), ReplicationConfig::default())
        .with_global_budget(cost_cap(2.0));

    let bundle = barrier
        .replicate(&Task::new("q", json!({})), 5, 0.1, &schema())
        .await
        .unwrap();

    assert_eq!(executor.call_count(), 2);
    assert_eq!(bundle.meta.usage_total, CALL_USAGE + CALL_USAGE);
    assert!(bundle.replicates[2..].iter().all(|r| !r.quality.valid));
}

#![allow(dead_code)]

use proptest::prelude::*;
use scatter_core::orchestration::ErrorCategory;
use serde_json::{json, Value};

/// A breaker call outcome: `true` is a success
pub fn outcome_sequence_strategy() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..40)
}

/// Breaker thresholds small enough to be crossed by generated sequences
pub fn threshold_strategy() -> impl Strategy<Value = (u32, u32)> {
    (1u32..=6, 1u32..=4)
}

/// Categories an executor fault can classify into
pub fn executor_category_strategy() -> impl Strategy<Value = ErrorCategory> {
    prop_oneof![
        Just(ErrorCategory::Auth),
        Just(ErrorCategory::RateLimit),
        Just(ErrorCategory::Validation),
        Just(ErrorCategory::ServerError),
        Just(ErrorCategory::Network),
        Just(ErrorCategory::Timeout),
        Just(ErrorCategory::Unknown),
    ]
}

/// Replica outputs over the `label`/`score`/`flagged` schema, with the
/// occasional malformed output
pub fn replica_output_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        8 => (
            prop_oneof![Just("cat"), Just("dog"), Just("bird")],
            -100.0f64..100.0,
            any::<bool>(),
        )
            .prop_map(|(label, score, flagged)| json!({
                "label": label,
                "score": score,
                "flagged": flagged,
            })),
        1 => Just(json!({"label": 3})),
        1 => Just(Value::Null),
    ]
}

pub fn replica_outputs_strategy() -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(replica_output_strategy(), 1..8)
}

/// Per-task outcome for orchestrator runs: `true` succeeds
pub fn task_plan_strategy() -> impl Strategy<Value = (Vec<bool>, usize)> {
    (prop::collection::vec(any::<bool>(), 1..12), 1usize..5)
}

//! Scripted executors for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use scatter_core::execution::{ExecutionContext, ExecutionError, ExecutionOutput, TaskExecutor};
use scatter_core::orchestration::Usage;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Usage reported by every scripted call unless a behavior overrides it
pub const CALL_USAGE: Usage = Usage {
    input_tokens: 10,
    output_tokens: 5,
    cost_units: 1.0,
};

#[derive(Debug, Clone)]
pub enum Behavior {
    /// Echo the payload back
    Echo,
    /// Return a fixed output
    Output(Value),
    /// Fail every call with this error
    FailAlways(ExecutionError),
    /// Fail the first `n` calls, then echo
    FailTimes(u32, ExecutionError),
    Panic,
}

/// One observed executor call
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub task_id: String,
    pub attempt: u32,
    pub seed: Option<u64>,
    pub at: Instant,
}

/// Executor whose behavior is scripted per task id
pub struct ScriptedExecutor {
    behaviors: HashMap<String, Behavior>,
    default_behavior: Behavior,
    latency: Duration,
    calls: Mutex<Vec<CallRecord>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            default_behavior: Behavior::Echo,
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_behavior(mut self, task_id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(task_id.to_string(), behavior);
        self
    }

    pub fn with_default(mut self, behavior: Behavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    /// Simulated endpoint latency per call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, task_id: &str) -> Vec<CallRecord> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        payload: &Value,
        context: &ExecutionContext,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let calls_so_far = {
            let mut calls = self.calls.lock();
            let prior = calls.iter().filter(|c| c.task_id == context.task_id).count();
            calls.push(CallRecord {
                task_id: context.task_id.clone(),
                attempt: context.attempt,
                seed: context.seed,
                at: Instant::now(),
            });
            prior as u32
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let behavior = self
            .behaviors
            .get(&context.task_id)
            .unwrap_or(&self.default_behavior);

        match behavior {
            Behavior::Echo => Ok(ExecutionOutput::new(payload.clone(), CALL_USAGE)),
            Behavior::Output(output) => Ok(ExecutionOutput::new(output.clone(), CALL_USAGE)),
            Behavior::FailAlways(error) => Err(error.clone().with_usage(CALL_USAGE)),
            Behavior::FailTimes(n, error) if calls_so_far < *n => {
                Err(error.clone().with_usage(CALL_USAGE))
            }
            Behavior::FailTimes(..) => Ok(ExecutionOutput::new(payload.clone(), CALL_USAGE)),
            Behavior::Panic => panic!("scripted executor panic for {}", context.task_id),
        }
    }
}

pub fn network_error() -> ExecutionError {
    ExecutionError::new("connection reset by peer")
}

pub fn server_error() -> ExecutionError {
    ExecutionError::new("upstream returned 503").with_status(503)
}

pub fn validation_error() -> ExecutionError {
    ExecutionError::new("prompt exceeds schema").with_status(422)
}

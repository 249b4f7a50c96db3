//! # Replication Barrier
//!
//! Runs one task K times through the orchestrator and reduces the replicas
//! to an `EvidenceBundle`. The first two replicas run together; when their
//! distance is within epsilon the remaining replicas are never submitted.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::confidence::{AgreementSpreadConfidence, ConfidencePolicy};
use super::distance::replicate_distance;
use super::evidence::{reduce, EvidenceBundle, EvidenceMeta, Replicate, SizeCaps};
use super::schema::SchemaValidator;
use crate::config::ReplicationConfig;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::orchestration::{
    GlobalBudget, OrchestrationOutput, OrchestrationRequest, Orchestrator, Task, TaskResult,
    Usage,
};

/// Replicas that run before the early-stop check
const EARLY_STOP_REPLICAS: usize = 2;

pub struct ReplicationBarrier {
    orchestrator: Arc<Orchestrator>,
    config: ReplicationConfig,
    confidence: Arc<dyn ConfidencePolicy>,
    seed: Option<u64>,
    global_budget: GlobalBudget,
    max_parallel: Option<usize>,
}

impl std::fmt::Debug for ReplicationBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationBarrier")
            .field("config", &self.config)
            .field("confidence", &self.confidence.policy_name())
            .field("seed", &self.seed)
            .field("global_budget", &self.global_budget)
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}

impl ReplicationBarrier {
    pub fn new(orchestrator: Arc<Orchestrator>, config: ReplicationConfig) -> Self {
        Self {
            orchestrator,
            config,
            confidence: Arc::new(AgreementSpreadConfidence::default()),
            seed: None,
            global_budget: GlobalBudget::unlimited(),
            max_parallel: None,
        }
    }

    pub fn with_confidence_policy(mut self, policy: Arc<dyn ConfidencePolicy>) -> Self {
        self.confidence = policy;
        self
    }

    /// Replica `i` (0-based) receives `seed + i`
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Ceiling for the whole replicated run. The remaining replicas only
    /// get what the early pair left unspent.
    pub fn with_global_budget(mut self, budget: GlobalBudget) -> Self {
        self.global_budget = budget;
        self
    }

    /// Concurrent replicas per phase; defaults to the whole phase
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel.max(1));
        self
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Replicate with the configured `k` and `epsilon`
    pub async fn replicate_with_defaults(
        &self,
        task: &Task,
        schema: &dyn SchemaValidator,
    ) -> OrchestrationResult<EvidenceBundle> {
        self.replicate(task, self.config.k, self.config.epsilon, schema)
            .await
    }

    pub async fn replicate(
        &self,
        task: &Task,
        k: usize,
        epsilon: f64,
        schema: &dyn SchemaValidator,
    ) -> OrchestrationResult<EvidenceBundle> {
        self.replicate_with_cancellation(task, k, epsilon, schema, CancellationToken::new())
            .await
    }

    pub async fn replicate_with_cancellation(
        &self,
        task: &Task,
        k: usize,
        epsilon: f64,
        schema: &dyn SchemaValidator,
        cancellation: CancellationToken,
    ) -> OrchestrationResult<EvidenceBundle> {
        if k == 0 {
            return Err(OrchestrationError::InvalidRequest(
                "replication requires k >= 1".to_string(),
            ));
        }
        if !epsilon.is_finite() || epsilon < 0.0 {
            return Err(OrchestrationError::InvalidRequest(format!(
                "epsilon must be finite and non-negative, got {epsilon}"
            )));
        }

        let started_at = Instant::now();
        let early = k.min(EARLY_STOP_REPLICAS);
        info!(
            task_id = %task.id,
            k = k,
            epsilon = epsilon,
            "Starting replicated execution"
        );

        let first = self
            .run_phase(task, 0..early, self.global_budget, &cancellation)
            .await?;
        let mut usage_total = first.usage_total;
        let mut replicates = to_replicates(first.results, schema);

        let early_distance = (replicates.len() >= EARLY_STOP_REPLICAS)
            .then(|| replicate_distance(&replicates[0], &replicates[1], schema.fields()));
        let early_stopped = k > early && early_distance.is_some_and(|d| d <= epsilon);

        if early_stopped {
            debug!(
                task_id = %task.id,
                distance = early_distance.unwrap_or_default(),
                skipped = k - early,
                "Early replicas agree, skipping the rest"
            );
        } else if k > early && !cancellation.is_cancelled() {
            let remaining =
                remaining_budget(&self.global_budget, usage_total, started_at.elapsed());
            let rest = self
                .run_phase(task, early..k, remaining, &cancellation)
                .await?;
            usage_total += rest.usage_total;
            replicates.extend(to_replicates(rest.results, schema));
        }

        let summary = reduce(
            &replicates,
            schema.fields(),
            SizeCaps::from(&self.config),
            self.confidence.as_ref(),
        );

        info!(
            task_id = %task.id,
            completed = replicates.len(),
            early_stopped = early_stopped,
            confidence = summary.confidence,
            truncated = summary.truncated,
            "Replicated execution complete"
        );

        Ok(EvidenceBundle {
            meta: EvidenceMeta {
                task_id: task.id.clone(),
                requested_replicas: k,
                completed_replicas: replicates.len(),
                epsilon,
                early_distance,
                early_stopped,
                usage_total,
                elapsed: started_at.elapsed(),
                confidence_policy: self.confidence.policy_name().to_string(),
            },
            replicates,
            summary,
        })
    }

    async fn run_phase(
        &self,
        task: &Task,
        indices: std::ops::Range<usize>,
        budget: GlobalBudget,
        cancellation: &CancellationToken,
    ) -> OrchestrationResult<OrchestrationOutput> {
        let offset = indices.start as u64;
        let tasks: Vec<Task> = indices.map(|index| replica_task(task, index)).collect();
        let max_parallel = self.max_parallel.unwrap_or(tasks.len());

        let mut request = OrchestrationRequest::new(tasks)
            .with_max_parallel(max_parallel)
            .with_global_budget(budget);
        if let Some(seed) = self.seed {
            // The orchestrator adds each task's index within the phase
            request = request.with_seed(seed.wrapping_add(offset));
        }

        self.orchestrator
            .run_with_cancellation(request, cancellation.clone())
            .await
    }
}

/// What is left of `budget` after `spent` and `elapsed`
fn remaining_budget(budget: &GlobalBudget, spent: Usage, elapsed: Duration) -> GlobalBudget {
    GlobalBudget {
        max_duration: budget
            .max_duration
            .map(|max_duration| max_duration.saturating_sub(elapsed)),
        max_cost_units: budget
            .max_cost_units
            .map(|max_cost| (max_cost - spent.cost_units).max(0.0)),
    }
}

/// Replicas never share an idempotency key; each must actually run
fn replica_task(task: &Task, index: usize) -> Task {
    Task {
        id: format!("{}#r{}", task.id, index + 1),
        idempotency_key: None,
        ..task.clone()
    }
}

fn to_replicates(results: Vec<TaskResult>, schema: &dyn SchemaValidator) -> Vec<Replicate> {
    results
        .into_iter()
        .map(|result| {
            let usage: Usage = result.usage;
            let replicate = match (result.output, result.error) {
                (Some(output), _) if result.status.is_success() => {
                    let errors = schema.validate(&output);
                    if errors.is_empty() {
                        Replicate::valid(result.task_id, output)
                    } else {
                        Replicate::invalid(result.task_id, output, errors)
                    }
                }
                (output, error) => Replicate::invalid(
                    result.task_id,
                    output.unwrap_or_default(),
                    vec![error.map_or_else(|| result.status.to_string(), |e| e.to_string())],
                ),
            };
            replicate.with_usage(usage)
        })
        .collect()
}

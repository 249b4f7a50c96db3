//! # Global Budget Tracking
//!
//! Request-scoped ceiling on wall-clock time and cost. The tracker owns the
//! run's cancellation token: exceeding either limit cancels it, which stops
//! admission and signals in-flight tasks to stop at their next safe point.
//! A caller-supplied parent token cancels the run the same way.

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::error_classifier::ErrorCategory;
use super::types::{Fault, GlobalBudget, Usage};

/// Why a run stopped admitting work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    DurationExceeded,
    CostExceeded,
    /// The caller cancelled the run through its own token
    Caller,
}

/// Tracks one run's spend against its global budget
#[derive(Debug)]
pub struct BudgetTracker {
    budget: GlobalBudget,
    started_at: Instant,
    spent: Mutex<Usage>,
    reason: OnceLock<CancelReason>,
    token: CancellationToken,
}

impl BudgetTracker {
    /// Start tracking. When `parent` is given, cancelling it cancels this run.
    pub fn new(budget: GlobalBudget, parent: Option<&CancellationToken>) -> Arc<Self> {
        let token = parent
            .map(CancellationToken::child_token)
            .unwrap_or_else(CancellationToken::new);

        Arc::new(Self {
            budget,
            started_at: Instant::now(),
            spent: Mutex::new(Usage::default()),
            reason: OnceLock::new(),
            token,
        })
    }

    /// Token cancelled when the run must stop admitting and executing work
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn budget(&self) -> &GlobalBudget {
        &self.budget
    }

    /// Absolute deadline implied by the duration limit
    pub fn deadline(&self) -> Option<Instant> {
        self.budget
            .max_duration
            .map(|max_duration| self.started_at + max_duration)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn spent(&self) -> Usage {
        *self.spent.lock()
    }

    /// Account usage reported by any task; trips the cost limit when reached
    pub fn record(&self, usage: Usage) {
        if usage.is_zero() {
            return;
        }

        let total_cost = {
            let mut spent = self.spent.lock();
            *spent += usage;
            spent.cost_units
        };

        if let Some(limit) = self.budget.max_cost_units {
            if total_cost >= limit {
                self.exceed(CancelReason::CostExceeded);
            }
        }
    }

    /// `Ok` while work may continue, otherwise the fault explaining why not
    pub fn check(&self) -> Result<(), Fault> {
        if !self.token.is_cancelled() {
            let cost_reached = self
                .budget
                .max_cost_units
                .is_some_and(|limit| self.spent().cost_units >= limit);
            let deadline_passed = self
                .deadline()
                .is_some_and(|deadline| Instant::now() >= deadline);

            if cost_reached {
                self.exceed(CancelReason::CostExceeded);
            } else if deadline_passed {
                self.exceed(CancelReason::DurationExceeded);
            } else {
                return Ok(());
            }
        }
        Err(self.cancellation_fault())
    }

    pub fn is_exhausted(&self) -> bool {
        self.check().is_err()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied().or_else(|| {
            self.token
                .is_cancelled()
                .then_some(CancelReason::Caller)
        })
    }

    /// Fault attached to tasks cut short by cancellation
    pub fn cancellation_fault(&self) -> Fault {
        match self.reason() {
            Some(CancelReason::DurationExceeded) => Fault::budget_exceeded(format!(
                "global duration budget of {}ms exhausted",
                self.budget.max_duration.unwrap_or_default().as_millis()
            )),
            Some(CancelReason::CostExceeded) => Fault::budget_exceeded(format!(
                "global cost budget of {} units exhausted",
                self.budget.max_cost_units.unwrap_or_default()
            )),
            Some(CancelReason::Caller) | None => {
                Fault::new(ErrorCategory::Unknown, "cancelled by caller", false)
            }
        }
    }

    fn exceed(&self, reason: CancelReason) {
        if self.reason.set(reason).is_ok() {
            let spent = self.spent();
            warn!(
                reason = ?reason,
                elapsed_ms = self.elapsed().as_millis() as u64,
                cost_units = spent.cost_units,
                total_tokens = spent.total_tokens(),
                "Global budget exhausted, cancelling run"
            );
        }
        self.token.cancel();
    }

    /// Cancel the run when the duration limit passes, even if nobody polls
    pub fn spawn_watchdog(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let deadline = self.deadline()?;
        let tracker = Arc::clone(self);

        Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tracker.exceed(CancelReason::DurationExceeded);
                }
                _ = tracker.token.cancelled() => {}
            }
        }))
    }
}

//! Repair of plans left `failed` after their tasks recovered.
//!
//! A plan can be marked failed by one loop while another run of the same
//! task later succeeds, leaving the plan stuck. [`Reconciler`] examines the
//! most recent failed plans and moves the recoverable ones to `paused` so a
//! human (or scheduler) can resume them. Two rules apply, in order:
//!
//! 1. The plan's current task is `completed` → paused, current task kept.
//! 2. None of the plan's tasks is `failed` → paused, current task cleared.
//!
//! Each repair is a conditional write from `failed`, so running the
//! reconciler twice, or concurrently, never repairs a plan twice. Plans are
//! processed concurrently and a failure on one never affects the others.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::state::{Plan, PlanStatus, PlanUpdate, StateStore, Task, TaskHistogram, TaskStatus};

/// Failed plans examined per pass.
pub const RECONCILE_BATCH_SIZE: usize = 10;

/// Reason recorded for the current-task-completed rule.
pub const REASON_CURRENT_TASK_COMPLETED: &str = "Current task completed but plan was failed";

/// Reason recorded for the no-failed-tasks rule.
pub const REASON_NO_FAILED_TASKS: &str = "No failed tasks but plan was marked failed";

/// Which repair rule matched a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairRule {
    CurrentTaskCompleted,
    NoFailedTasks,
}

impl RepairRule {
    /// Human-readable reason.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::CurrentTaskCompleted => REASON_CURRENT_TASK_COMPLETED,
            Self::NoFailedTasks => REASON_NO_FAILED_TASKS,
        }
    }

    fn update(self) -> PlanUpdate {
        match self {
            Self::CurrentTaskCompleted => PlanUpdate::status(PlanStatus::Paused),
            Self::NoFailedTasks => PlanUpdate::status(PlanStatus::Paused).clear_current_task(),
        }
    }
}

/// Decide which rule, if any, applies to a failed plan.
#[must_use]
pub fn evaluate(plan: &Plan, tasks: &[Task]) -> Option<RepairRule> {
    let current_completed = plan.current_task_id.as_deref().is_some_and(|current| {
        tasks
            .iter()
            .any(|t| t.id == current && t.status == TaskStatus::Completed)
    });
    if current_completed {
        return Some(RepairRule::CurrentTaskCompleted);
    }
    let histogram = TaskHistogram::from_tasks(tasks);
    if histogram.failed == 0 && histogram.running == 0 && histogram.pending > 0 {
        return Some(RepairRule::NoFailedTasks);
    }
    None
}

/// Outcome for one examined plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub plan_id: String,
    pub title: String,
    pub tasks: TaskHistogram,
    /// The plan was moved to `paused` by this pass.
    pub fixed: bool,
    /// Rule that matched; empty when none did.
    pub reason: String,
    pub previous_status: PlanStatus,
    pub new_status: PlanStatus,
    /// Why a matching repair could not be applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    /// Failed plans examined.
    pub checked: usize,
    /// Plans repaired.
    pub fixed: usize,
    pub results: Vec<ReconciliationResult>,
}

impl ReconciliationReport {
    fn from_results(results: Vec<ReconciliationResult>) -> Self {
        Self {
            checked: results.len(),
            fixed: results.iter().filter(|r| r.fixed).count(),
            results,
        }
    }

    /// Results whose repair could not be applied.
    pub fn errors(&self) -> impl Iterator<Item = &ReconciliationResult> {
        self.results.iter().filter(|r| r.error.is_some())
    }
}

/// Finds and repairs stuck plans.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    batch_size: usize,
}

impl Reconciler {
    /// Reconciler over `store` with the default batch size.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            batch_size: RECONCILE_BATCH_SIZE,
        }
    }

    /// Examine up to `batch_size` failed plans per pass.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Examine the most recent failed plans and repair the recoverable ones.
    ///
    /// # Errors
    ///
    /// Fails only if the failed plans cannot be listed. Per-plan problems are
    /// reported in the matching [`ReconciliationResult`].
    pub async fn repair_stuck_plans(&self) -> Result<ReconciliationReport> {
        let plans = self
            .store
            .recent_plans(Some(PlanStatus::Failed), self.batch_size)
            .await?;
        debug!(count = plans.len(), "Examining failed plans");

        let results = join_all(plans.into_iter().map(|plan| self.reconcile_plan(plan))).await;
        let report = ReconciliationReport::from_results(results);

        info!(
            checked = report.checked,
            fixed = report.fixed,
            errors = report.errors().count(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_plan(&self, plan: Plan) -> ReconciliationResult {
        let mut result = ReconciliationResult {
            plan_id: plan.id.clone(),
            title: plan.title.clone(),
            tasks: TaskHistogram::default(),
            fixed: false,
            reason: String::new(),
            previous_status: plan.status,
            new_status: plan.status,
            error: None,
        };

        let tasks = match self.store.tasks_for_plan(&plan.id).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(plan_id = %plan.id, error = %e, "Could not load plan tasks");
                result.error = Some(e.to_string());
                return result;
            }
        };
        result.tasks = TaskHistogram::from_tasks(&tasks);

        let Some(rule) = evaluate(&plan, &tasks) else {
            debug!(plan_id = %plan.id, "Plan failure is genuine");
            return result;
        };
        result.reason = rule.reason().to_string();

        match self
            .store
            .update_plan(&plan.id, PlanStatus::Failed, rule.update())
            .await
        {
            Ok(updated) => {
                info!(plan_id = %plan.id, reason = rule.reason(), "Repaired stuck plan");
                result.fixed = true;
                result.new_status = updated.status;
            }
            Err(e) => {
                warn!(plan_id = %plan.id, error = %e, "Could not repair plan");
                result.error = Some(e.to_string());
            }
        }
        result
    }
}

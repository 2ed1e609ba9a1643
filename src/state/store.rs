//! The task/plan store interface and its in-memory implementation.
//!
//! The store is the single source of truth shared by every orchestrator loop
//! and the reconciler. It exposes reads plus a narrow set of *conditional*
//! writes: each one names the status it expects to find and fails with
//! [`GatekeeperError::Conflict`] instead of overwriting when another writer
//! got there first.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use super::{Plan, PlanStatus, Task, TaskStatus};
use crate::error::{GatekeeperError, Result};

/// Async interface over the shared task/plan graph.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Look up a task.
    async fn task(&self, task_id: &str) -> Result<Option<Task>>;

    /// Look up a plan.
    async fn plan(&self, plan_id: &str) -> Result<Option<Plan>>;

    /// Tasks owned by a plan, in plan order.
    async fn tasks_for_plan(&self, plan_id: &str) -> Result<Vec<Task>>;

    /// The `limit` most recently created plans, newest first, optionally
    /// restricted to one status.
    async fn recent_plans(&self, status: Option<PlanStatus>, limit: usize) -> Result<Vec<Plan>>;

    /// Add a plan together with its ordered tasks.
    async fn insert_plan(&self, plan: Plan, tasks: Vec<Task>) -> Result<()>;

    /// Move a task to `to` if its current status is one of `expected`.
    async fn transition_task(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<Task>;

    /// Record the attempt number of a running task.
    async fn record_attempt(&self, task_id: &str, attempt: u32) -> Result<Task>;

    /// Apply `update` to a plan if its current status is `expected`.
    async fn update_plan(
        &self,
        plan_id: &str,
        expected: PlanStatus,
        update: PlanUpdate,
    ) -> Result<Plan>;
}

/// Changes applied to a plan by [`StateStore::update_plan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanUpdate {
    /// New status, if changing.
    pub status: Option<PlanStatus>,
    /// New current task: `Some(None)` clears it, `None` leaves it unchanged.
    pub current_task_id: Option<Option<String>>,
}

impl PlanUpdate {
    /// Change only the status.
    #[must_use]
    pub fn status(status: PlanStatus) -> Self {
        Self {
            status: Some(status),
            current_task_id: None,
        }
    }

    /// Also point the plan at `task_id`.
    #[must_use]
    pub fn with_current_task(mut self, task_id: impl Into<String>) -> Self {
        self.current_task_id = Some(Some(task_id.into()));
        self
    }

    /// Also clear the current task.
    #[must_use]
    pub fn clear_current_task(mut self) -> Self {
        self.current_task_id = Some(None);
        self
    }
}

fn expected_list(expected: &[TaskStatus]) -> String {
    expected
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("|")
}

/// Serializable snapshot of the whole graph.
///
/// Both store implementations delegate their conditional-write logic here so
/// the precondition and state machine checks are identical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    /// Plans in creation order.
    #[serde(default)]
    pub plans: Vec<Plan>,
    /// Tasks in creation order (plan order within a plan).
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl StateDocument {
    /// Look up a task.
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Look up a plan.
    #[must_use]
    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    /// Tasks owned by a plan, in plan order.
    #[must_use]
    pub fn tasks_for_plan(&self, plan_id: &str) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.plan_id == plan_id)
            .cloned()
            .collect()
    }

    /// The `limit` most recently created plans with `status` (any status
    /// when `None`), newest first.
    ///
    /// Ties on `created_at` resolve to the later insertion.
    #[must_use]
    pub fn recent_plans(&self, status: Option<PlanStatus>, limit: usize) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self
            .plans
            .iter()
            .rev()
            .filter(|p| status.is_none_or(|s| p.status == s))
            .cloned()
            .collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        plans.truncate(limit);
        plans
    }

    /// Add a plan and its tasks.
    ///
    /// # Errors
    ///
    /// Fails if an id is already taken or a task names a different plan.
    pub fn insert_plan(&mut self, plan: Plan, tasks: Vec<Task>) -> Result<()> {
        if self.plan(&plan.id).is_some() {
            return Err(GatekeeperError::store(format!(
                "plan {} already exists",
                plan.id
            )));
        }
        for task in &tasks {
            if task.plan_id != plan.id {
                return Err(GatekeeperError::store(format!(
                    "task {} belongs to plan {}, not {}",
                    task.id, task.plan_id, plan.id
                )));
            }
            if self.task(&task.id).is_some() {
                return Err(GatekeeperError::store(format!(
                    "task {} already exists",
                    task.id
                )));
            }
        }
        if let Some(current) = &plan.current_task_id {
            if !tasks.iter().any(|t| &t.id == current) {
                return Err(GatekeeperError::store(format!(
                    "current task {} is not owned by plan {}",
                    current, plan.id
                )));
            }
        }

        self.plans.push(plan);
        self.tasks.extend(tasks);
        Ok(())
    }

    /// Conditionally move a task to a new status.
    ///
    /// # Errors
    ///
    /// `TaskNotFound`, `Conflict` when the current status is not in
    /// `expected`, `InvalidTransition` when the state machine forbids it.
    pub fn transition_task(
        &mut self,
        task_id: &str,
        expected: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<Task> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| GatekeeperError::task_not_found(task_id))?;

        if !expected.contains(&task.status) {
            return Err(GatekeeperError::Conflict {
                entity: "task",
                id: task_id.to_string(),
                expected: expected_list(expected),
                actual: task.status.to_string(),
            });
        }
        if !task.status.can_transition_to(to) {
            return Err(GatekeeperError::InvalidTransition {
                entity: "task",
                id: task_id.to_string(),
                from: task.status.to_string(),
                to: to.to_string(),
            });
        }

        task.status = to;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    /// Record the attempt number of a running task.
    ///
    /// # Errors
    ///
    /// `Conflict` if the task is no longer running.
    pub fn record_attempt(&mut self, task_id: &str, attempt: u32) -> Result<Task> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| GatekeeperError::task_not_found(task_id))?;

        if task.status != TaskStatus::Running {
            return Err(GatekeeperError::Conflict {
                entity: "task",
                id: task_id.to_string(),
                expected: TaskStatus::Running.to_string(),
                actual: task.status.to_string(),
            });
        }

        task.attempt = attempt;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    /// Conditionally update a plan.
    ///
    /// # Errors
    ///
    /// `PlanNotFound`, `Conflict` when the status is not `expected`,
    /// `InvalidTransition` for a forbidden status change, and `Store` when the
    /// new current task is not owned by the plan.
    pub fn update_plan(
        &mut self,
        plan_id: &str,
        expected: PlanStatus,
        update: PlanUpdate,
    ) -> Result<Plan> {
        if let Some(Some(task_id)) = &update.current_task_id {
            let owned = self
                .tasks
                .iter()
                .any(|t| &t.id == task_id && t.plan_id == plan_id);
            if !owned {
                return Err(GatekeeperError::store(format!(
                    "task {task_id} is not owned by plan {plan_id}"
                )));
            }
        }

        let plan = self
            .plans
            .iter_mut()
            .find(|p| p.id == plan_id)
            .ok_or_else(|| GatekeeperError::plan_not_found(plan_id))?;

        if plan.status != expected {
            return Err(GatekeeperError::Conflict {
                entity: "plan",
                id: plan_id.to_string(),
                expected: expected.to_string(),
                actual: plan.status.to_string(),
            });
        }
        if let Some(next) = update.status {
            if next != plan.status && !plan.status.can_transition_to(next) {
                return Err(GatekeeperError::InvalidTransition {
                    entity: "plan",
                    id: plan_id.to_string(),
                    from: plan.status.to_string(),
                    to: next.to_string(),
                });
            }
            plan.status = next;
        }
        if let Some(current) = update.current_task_id {
            plan.current_task_id = current;
        }

        plan.updated_at = Utc::now();
        Ok(plan.clone())
    }
}

/// In-memory store for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: RwLock<StateDocument>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `doc`.
    #[must_use]
    pub fn from_document(doc: StateDocument) -> Self {
        Self {
            doc: RwLock::new(doc),
        }
    }

    /// Copy of the current graph.
    pub fn snapshot(&self) -> Result<StateDocument> {
        self.read(|doc| Ok(doc.clone()))
    }

    fn read<T>(&self, f: impl FnOnce(&StateDocument) -> Result<T>) -> Result<T> {
        let doc = self
            .doc
            .read()
            .map_err(|e| GatekeeperError::store(e.to_string()))?;
        f(&doc)
    }

    fn write<T>(&self, f: impl FnOnce(&mut StateDocument) -> Result<T>) -> Result<T> {
        let mut doc = self
            .doc
            .write()
            .map_err(|e| GatekeeperError::store(e.to_string()))?;
        f(&mut doc)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn task(&self, task_id: &str) -> Result<Option<Task>> {
        self.read(|doc| Ok(doc.task(task_id).cloned()))
    }

    async fn plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        self.read(|doc| Ok(doc.plan(plan_id).cloned()))
    }

    async fn tasks_for_plan(&self, plan_id: &str) -> Result<Vec<Task>> {
        self.read(|doc| Ok(doc.tasks_for_plan(plan_id)))
    }

    async fn recent_plans(&self, status: Option<PlanStatus>, limit: usize) -> Result<Vec<Plan>> {
        self.read(|doc| Ok(doc.recent_plans(status, limit)))
    }

    async fn insert_plan(&self, plan: Plan, tasks: Vec<Task>) -> Result<()> {
        self.write(|doc| doc.insert_plan(plan, tasks))
    }

    async fn transition_task(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<Task> {
        self.write(|doc| doc.transition_task(task_id, expected, to))
    }

    async fn record_attempt(&self, task_id: &str, attempt: u32) -> Result<Task> {
        self.write(|doc| doc.record_attempt(task_id, attempt))
    }

    async fn update_plan(
        &self,
        plan_id: &str,
        expected: PlanStatus,
        update: PlanUpdate,
    ) -> Result<Plan> {
        self.write(|doc| doc.update_plan(plan_id, expected, update))
    }
}

//! Task and plan state model.
//!
//! A [`Plan`] owns an ordered set of [`Task`]s. Both carry a status whose
//! legal transitions are encoded here and enforced by every
//! [`StateStore`](store::StateStore) implementation, on top of the
//! expected-status precondition each write carries.
//!
//! ```text
//! Task:  pending ──► running ──► completed
//!                     │  ▲
//!                     ▼  │ (re-trigger)
//!                    failed
//!
//! Plan:  pending ──► running ──► completed
//!           ▲          │
//!           │          ▼
//!        paused ◄── failed        (failed → paused: reconciler only)
//! ```

pub mod file_store;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use file_store::FileStore;
pub use store::{MemoryStore, PlanUpdate, StateDocument, StateStore};

/// Status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Check whether the state machine allows moving to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Failed, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    /// Terminal statuses end a retry loop.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Lower-case name used in logs and reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl PlanStatus {
    /// Check whether the state machine allows moving to `next`.
    ///
    /// `Running -> Running` is allowed so the current task can advance.
    /// `Failed -> Paused` is reserved for the reconciler; the store does not
    /// know who is calling, so that restriction lives in the orchestrator.
    #[must_use]
    pub fn can_transition_to(self, next: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Paused, Running)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Paused)
                | (Paused, Pending)
        )
    }

    /// Lower-case name used in logs and reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work composed of ordered tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub title: String,
    pub status: PlanStatus,
    /// Task currently being worked on; always owned by this plan.
    pub current_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    /// Create a pending plan with a fresh id.
    pub fn new(title: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), title)
    }

    /// Create a pending plan with an explicit id.
    pub fn with_id(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            status: PlanStatus::Pending,
            current_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the status (builder style, for seeding).
    #[must_use]
    pub fn with_status(mut self, status: PlanStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the current task (builder style, for seeding).
    #[must_use]
    pub fn with_current_task(mut self, task_id: impl Into<String>) -> Self {
        self.current_task_id = Some(task_id.into());
        self
    }
}

/// A single change validated by the gate suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub plan_id: String,
    pub title: String,
    pub status: TaskStatus,
    /// Attempt number of the latest (or current) loop iteration; 0 before the
    /// first run.
    pub attempt: u32,
    /// Task-specific retry budget; falls back to the repository default.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Commit the task's changes are based on. `HEAD` when unset.
    #[serde(default)]
    pub base_commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task with a fresh id.
    pub fn new(plan_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), plan_id, title)
    }

    /// Create a pending task with an explicit id.
    pub fn with_id(
        id: impl Into<String>,
        plan_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            plan_id: plan_id.into(),
            title: title.into(),
            status: TaskStatus::Pending,
            attempt: 0,
            max_attempts: None,
            base_commit: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the status (builder style, for seeding).
    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Set a task-level retry budget.
    #[must_use]
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Set the base commit for diff construction.
    #[must_use]
    pub fn with_base_commit(mut self, commit: impl Into<String>) -> Self {
        self.base_commit = Some(commit.into());
        self
    }

    /// Commit to diff against.
    #[must_use]
    pub fn base_commit_or_head(&self) -> &str {
        self.base_commit.as_deref().unwrap_or("HEAD")
    }
}

/// Counts of task statuses within one plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHistogram {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskHistogram {
    /// Count statuses across `tasks`.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut histogram = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => histogram.pending += 1,
                TaskStatus::Running => histogram.running += 1,
                TaskStatus::Completed => histogram.completed += 1,
                TaskStatus::Failed => histogram.failed += 1,
            }
        }
        histogram
    }

    /// Total number of tasks counted.
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Failed.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn test_plan_transitions() {
        use PlanStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Pending));
        assert!(Paused.can_transition_to(Running));

        assert!(!Failed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Paused));
        assert!(!Running.can_transition_to(Paused));
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&PlanStatus::Paused).unwrap(),
            "\"paused\""
        );
        let status: TaskStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(status, TaskStatus::Completed);
    }

    #[test]
    fn test_histogram() {
        let tasks = vec![
            Task::new("p", "a").with_status(TaskStatus::Completed),
            Task::new("p", "b"),
            Task::new("p", "c"),
            Task::new("p", "d").with_status(TaskStatus::Failed),
        ];
        let histogram = TaskHistogram::from_tasks(&tasks);
        assert_eq!(histogram.completed, 1);
        assert_eq!(histogram.pending, 2);
        assert_eq!(histogram.failed, 1);
        assert_eq!(histogram.running, 0);
        assert_eq!(histogram.total(), 4);
    }

    #[test]
    fn test_task_serializes_camel_case() {
        let task = Task::with_id("t1", "p1", "Add parser").with_max_attempts(4);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["planId"], "p1");
        assert_eq!(json["maxAttempts"], 4);
        assert_eq!(json["status"], "pending");
        assert_eq!(task.base_commit_or_head(), "HEAD");
    }
}

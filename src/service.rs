//! The trigger boundary.
//!
//! [`QaService`] is what an outer surface (the CLI, or an HTTP handler in an
//! embedding application) calls. It maps every outcome, including errors, to
//! a [`TriggerResponse`] so that request problems and internal faults are
//! reported differently and internal details never leak to the caller.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::error;

use crate::error::{GatekeeperError, Result};
use crate::orchestrator::{LoopHandle, RetryOrchestrator, RetryResult};
use crate::reconciler::{ReconciliationReport, Reconciler};

/// Response to a trigger request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerResponse {
    /// A synchronous loop finished.
    Completed { result: RetryResult },
    /// A background loop was started.
    Accepted { task_id: String },
    /// A reconciliation pass finished.
    Reconciled { report: ReconciliationReport },
    NotFound { message: String },
    /// The request conflicts with current state.
    Conflict { message: String },
    InternalError { message: String },
}

impl TriggerResponse {
    /// Classify an error for `subject` (a task id or operation name).
    #[must_use]
    pub fn from_error(subject: &str, err: &GatekeeperError) -> Self {
        match err {
            GatekeeperError::TaskNotFound { .. } | GatekeeperError::PlanNotFound { .. } => {
                Self::NotFound {
                    message: err.to_string(),
                }
            }
            GatekeeperError::TaskAlreadyRunning { .. }
            | GatekeeperError::InvalidTransition { .. }
            | GatekeeperError::Conflict { .. } => Self::Conflict {
                message: err.to_string(),
            },
            _ => {
                error!(subject, error = %err, "Internal error while handling trigger");
                Self::InternalError {
                    message: format!("internal error while processing {subject}"),
                }
            }
        }
    }

    /// Process exit code for this response.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed { result } if result.passed => 0,
            Self::Completed { .. } => 1,
            Self::Accepted { .. } | Self::Reconciled { .. } => 0,
            Self::NotFound { .. } | Self::Conflict { .. } => 2,
            Self::InternalError { .. } => 3,
        }
    }

    /// Whether the request itself succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Accepted { .. } | Self::Reconciled { .. }
        )
    }
}

/// Entry points for triggering loops and reconciliation.
pub struct QaService {
    orchestrator: RetryOrchestrator,
    reconciler: Reconciler,
    handles: Mutex<HashMap<String, LoopHandle>>,
}

impl QaService {
    /// Service over an orchestrator, reconciling against the same store.
    pub fn new(orchestrator: RetryOrchestrator) -> Self {
        let reconciler = Reconciler::new(orchestrator.store().clone());
        Self {
            orchestrator,
            reconciler,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the reconciler.
    #[must_use]
    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    /// The underlying orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &RetryOrchestrator {
        &self.orchestrator
    }

    /// Run the loop for `task_id` and wait for its verdict.
    pub async fn trigger_sync(&self, task_id: &str) -> TriggerResponse {
        match self.orchestrator.run_with_retry(task_id).await {
            Ok(result) => TriggerResponse::Completed { result },
            Err(e) => TriggerResponse::from_error(task_id, &e),
        }
    }

    /// Start the loop for `task_id` in the background and return at once.
    ///
    /// Request errors are still reported synchronously.
    pub async fn trigger_async(&self, task_id: &str) -> TriggerResponse {
        match self.orchestrator.spawn(task_id).await {
            Ok(handle) => {
                if let Ok(mut handles) = self.handles.lock() {
                    handles.insert(task_id.to_string(), handle);
                }
                TriggerResponse::Accepted {
                    task_id: task_id.to_string(),
                }
            }
            Err(e) => TriggerResponse::from_error(task_id, &e),
        }
    }

    /// Wait for a loop started by [`trigger_async`](Self::trigger_async).
    ///
    /// Returns `None` if this service has no handle for `task_id`.
    pub async fn wait(&self, task_id: &str) -> Option<Result<RetryResult>> {
        let handle = self.handles.lock().ok()?.remove(task_id)?;
        Some(handle.join().await)
    }

    /// Cancel the active loop for `task_id`.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.orchestrator.cancel(task_id)
    }

    /// Run one reconciliation pass.
    pub async fn reconcile(&self) -> TriggerResponse {
        match self.reconciler.repair_stuck_plans().await {
            Ok(report) => TriggerResponse::Reconciled { report },
            Err(e) => TriggerResponse::from_error("reconciliation", &e),
        }
    }
}

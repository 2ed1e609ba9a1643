//! The gate-driven retry loop.
//!
//! [`RetryOrchestrator`] claims a task, then repeats *run every gate → if
//! anything failed, hand diagnostics to the fixing agent* until the suite
//! passes, the retry budget is spent, or the loop is cancelled. The verdict
//! is written back to the task and its plan through conditional store
//! writes, so a loop never overwrites a state it did not expect.
//!
//! # Architecture
//!
//! ```text
//!  claim ──► attempt N ──► GateRunner ──all passed──► complete task, advance plan
//!              ▲                │
//!              │             failures
//!              │                ▼
//!              └── FixingAgent ◄── implicated files + before/after content
//!                                  (until attempt == budget → fail task and plan)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gatekeeper::orchestrator::{OrchestratorConfig, RetryOrchestrator};
//!
//! let orchestrator = RetryOrchestrator::new(store, gates, agent, OrchestratorConfig::new("."));
//! let result = orchestrator.run_with_retry("task-42").await?;
//! println!("passed={} after {} attempt(s)", result.passed, result.attempt);
//! ```

pub mod supervisor;

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{FixRequest, FixingAgent};
use crate::changes::{select_implicated, ChangeDetector, ContentProvider, FileDiff};
use crate::config::{ConfigLoader, FileConfigLoader, RepositoryConfig};
use crate::error::{GatekeeperError, Result};
use crate::events::{EventSink, ProgressEvent, TracingEventSink};
use crate::gates::{GateResult, GateRunner, GateSuiteResult};
use crate::state::{Plan, PlanStatus, PlanUpdate, StateStore, Task, TaskStatus};

pub use supervisor::{LoopGuard, LoopHandle, LoopRegistry};

/// Default cap on files included in a fix request.
pub const DEFAULT_MAX_IMPLICATED_FILES: usize = 20;

/// Default cap on bytes per side of each file diff.
pub const DEFAULT_MAX_FILE_BYTES: usize = 64 * 1024;

/// Attempts at a plan write (claim or advance) before giving up.
const PLAN_WRITE_ATTEMPTS: usize = 3;

// ============================================================================
// Configuration and results
// ============================================================================

/// Settings for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Repository the gates run against.
    pub repo_path: PathBuf,
    /// Overrides the agent timeout from the repository config.
    pub agent_timeout: Option<Duration>,
    pub max_implicated_files: usize,
    pub max_file_bytes: usize,
    /// Globs for files never sent to the agent.
    pub exclude_globs: Vec<String>,
}

impl OrchestratorConfig {
    /// Defaults for `repo_path`.
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            agent_timeout: None,
            max_implicated_files: DEFAULT_MAX_IMPLICATED_FILES,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            exclude_globs: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_exclude_globs(mut self, globs: &[&str]) -> Self {
        self.exclude_globs = globs.iter().map(|g| (*g).to_string()).collect();
        self
    }
}

/// How a loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopOutcome {
    Passed,
    MaxRetriesReached,
    Cancelled,
}

/// Verdict of a retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResult {
    /// The final attempt's gates all passed.
    pub passed: bool,
    /// Attempts started. Between 1 and the budget unless cancelled early.
    pub attempt: u32,
    pub outcome: LoopOutcome,
}

impl RetryResult {
    fn passed(attempt: u32) -> Self {
        Self {
            passed: true,
            attempt,
            outcome: LoopOutcome::Passed,
        }
    }

    fn exhausted(attempt: u32) -> Self {
        Self {
            passed: false,
            attempt,
            outcome: LoopOutcome::MaxRetriesReached,
        }
    }

    fn cancelled(attempt: u32) -> Self {
        Self {
            passed: false,
            attempt,
            outcome: LoopOutcome::Cancelled,
        }
    }
}

/// A task this orchestrator has moved to `running`.
struct Claim {
    task: Task,
    config: RepositoryConfig,
    budget: u32,
    guard: LoopGuard,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives tasks through the gate/fix loop.
///
/// Cheap to clone; clones share the store, collaborators and registry.
#[derive(Clone)]
pub struct RetryOrchestrator {
    store: Arc<dyn StateStore>,
    gates: Arc<dyn GateRunner>,
    agent: Arc<dyn FixingAgent>,
    events: Arc<dyn EventSink>,
    config_loader: Arc<dyn ConfigLoader>,
    content: ContentProvider,
    registry: LoopRegistry,
    settings: Arc<OrchestratorConfig>,
}

impl RetryOrchestrator {
    /// Orchestrator reading repository config from disk and logging events.
    pub fn new(
        store: Arc<dyn StateStore>,
        gates: Arc<dyn GateRunner>,
        agent: Arc<dyn FixingAgent>,
        settings: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            gates,
            agent,
            events: Arc::new(TracingEventSink),
            config_loader: Arc::new(FileConfigLoader),
            content: ContentProvider::default(),
            registry: LoopRegistry::new(),
            settings: Arc::new(settings),
        }
    }

    /// Send progress events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Load repository configuration through `loader`.
    #[must_use]
    pub fn with_config_loader(mut self, loader: Arc<dyn ConfigLoader>) -> Self {
        self.config_loader = loader;
        self
    }

    /// Resolve file contents through `content`.
    #[must_use]
    pub fn with_content_provider(mut self, content: ContentProvider) -> Self {
        self.content = content;
        self
    }

    /// Loops active in this process.
    #[must_use]
    pub fn registry(&self) -> &LoopRegistry {
        &self.registry
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Run the loop for `task_id` to completion.
    ///
    /// # Errors
    ///
    /// `TaskNotFound`, `PlanNotFound`, `TaskAlreadyRunning` and
    /// `InvalidTransition` reject the request before any gate runs. Store
    /// failures during the loop are returned after the task is marked failed.
    pub async fn run_with_retry(&self, task_id: &str) -> Result<RetryResult> {
        let claim = self.claim(task_id).await?;
        self.drive_guarded(claim).await
    }

    /// Claim `task_id` and run its loop in the background.
    ///
    /// The claim happens before this returns, so request errors surface here
    /// rather than inside the spawned loop.
    pub async fn spawn(&self, task_id: &str) -> Result<LoopHandle> {
        let claim = self.claim(task_id).await?;
        let token = claim.guard.token().clone();
        let id = claim.task.id.clone();

        let this = self.clone();
        let join = tokio::spawn(async move {
            let task_id = claim.task.id.clone();
            let result = this.drive_guarded(claim).await;
            if let Err(e) = &result {
                error!(task_id = %task_id, error = %e, "Background retry loop failed");
            }
            result
        });

        info!(task_id = %id, "Retry loop started in background");
        Ok(LoopHandle::new(id, token, join))
    }

    /// Cancel the active loop for `task_id`, if any.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.registry.cancel(task_id)
    }

    // ------------------------------------------------------------------------
    // Claiming
    // ------------------------------------------------------------------------

    async fn claim(&self, task_id: &str) -> Result<Claim> {
        let guard = self
            .registry
            .register(task_id)
            .ok_or_else(|| GatekeeperError::TaskAlreadyRunning {
                task_id: task_id.to_string(),
            })?;

        let task = self
            .store
            .task(task_id)
            .await?
            .ok_or_else(|| GatekeeperError::task_not_found(task_id))?;
        match task.status {
            TaskStatus::Running => {
                return Err(GatekeeperError::TaskAlreadyRunning {
                    task_id: task_id.to_string(),
                })
            }
            TaskStatus::Completed => {
                return Err(GatekeeperError::InvalidTransition {
                    entity: "task",
                    id: task_id.to_string(),
                    from: task.status.to_string(),
                    to: TaskStatus::Running.to_string(),
                })
            }
            TaskStatus::Pending | TaskStatus::Failed => {}
        }

        let plan = self
            .store
            .plan(&task.plan_id)
            .await?
            .ok_or_else(|| GatekeeperError::plan_not_found(&task.plan_id))?;
        ensure_plan_startable(&plan)?;

        let config = self.config_loader.load_config(&self.settings.repo_path)?;

        let task = self
            .store
            .transition_task(task_id, &[TaskStatus::Pending, TaskStatus::Failed], TaskStatus::Running)
            .await
            .map_err(|e| match e {
                GatekeeperError::Conflict { actual, .. } if actual == TaskStatus::Running.as_str() => {
                    GatekeeperError::TaskAlreadyRunning {
                        task_id: task_id.to_string(),
                    }
                }
                other => other,
            })?;

        if let Err(e) = self.attach_to_plan(plan, task_id).await {
            warn!(task_id, error = %e, "Could not attach task to plan, releasing claim");
            if let Err(revert) = self
                .store
                .transition_task(task_id, &[TaskStatus::Running], TaskStatus::Failed)
                .await
            {
                warn!(task_id, error = %revert, "Could not release task claim");
            }
            return Err(e);
        }

        let budget = config.effective_budget(task.max_attempts);
        Ok(Claim {
            task,
            config,
            budget,
            guard,
        })
    }

    /// Mark the plan running with `task_id` as its current task, re-reading
    /// the plan when another writer changes it first.
    async fn attach_to_plan(&self, mut plan: Plan, task_id: &str) -> Result<()> {
        let mut last_error = None;
        for _ in 0..PLAN_WRITE_ATTEMPTS {
            let update = PlanUpdate::status(PlanStatus::Running).with_current_task(task_id);
            match self.store.update_plan(&plan.id, plan.status, update).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    debug!(plan_id = %plan.id, error = %e, "Plan changed during claim, retrying");
                    plan = self
                        .store
                        .plan(&plan.id)
                        .await?
                        .ok_or_else(|| GatekeeperError::plan_not_found(&plan.id))?;
                    ensure_plan_startable(&plan)?;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| GatekeeperError::store("plan claim did not converge")))
    }

    // ------------------------------------------------------------------------
    // The loop
    // ------------------------------------------------------------------------

    /// Run the loop, failing the task if the loop panics.
    async fn drive_guarded(&self, claim: Claim) -> Result<RetryResult> {
        let task = claim.task.clone();
        match AssertUnwindSafe(self.drive(claim)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(task_id = %task.id, panic = %message, "Retry loop panicked");
                if let Err(cleanup) = self.fail_task(&task).await {
                    warn!(task_id = %task.id, error = %cleanup, "Could not mark task failed");
                }
                self.emit(ProgressEvent::LoopErrored {
                    task_id: task.id.clone(),
                    message: format!("retry loop panicked: {message}"),
                    at: Utc::now(),
                });
                Err(GatekeeperError::Other(anyhow::anyhow!(
                    "retry loop for task {} panicked: {message}",
                    task.id
                )))
            }
        }
    }

    async fn drive(&self, claim: Claim) -> Result<RetryResult> {
        let Claim {
            task,
            config,
            budget,
            guard,
        } = claim;
        let cancel = guard.token().clone();

        info!(task_id = %task.id, plan_id = %task.plan_id, budget, "Starting retry loop");
        self.emit(ProgressEvent::LoopStarted {
            task_id: task.id.clone(),
            plan_id: task.plan_id.clone(),
            budget,
            at: Utc::now(),
        });

        match self.attempts(&task, &config, budget, &cancel).await {
            Ok(result) => {
                info!(
                    task_id = %task.id,
                    passed = result.passed,
                    attempt = result.attempt,
                    outcome = ?result.outcome,
                    "Retry loop finished"
                );
                Ok(result)
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Retry loop errored");
                if let Err(cleanup) = self.fail_task(&task).await {
                    warn!(task_id = %task.id, error = %cleanup, "Could not mark task failed");
                }
                self.emit(ProgressEvent::LoopErrored {
                    task_id: task.id.clone(),
                    message: e.to_string(),
                    at: Utc::now(),
                });
                Err(e)
            }
        }
    }

    async fn attempts(
        &self,
        task: &Task,
        config: &RepositoryConfig,
        budget: u32,
        cancel: &CancellationToken,
    ) -> Result<RetryResult> {
        let repo = &self.settings.repo_path;
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(task, attempt).await;
            }
            attempt += 1;

            self.store.record_attempt(&task.id, attempt).await?;
            self.emit(ProgressEvent::AttemptStarted {
                task_id: task.id.clone(),
                attempt,
                at: Utc::now(),
            });

            let results = self.gates.run_gates(config, repo, cancel).await;
            if cancel.is_cancelled() {
                return self.finish_cancelled(task, attempt).await;
            }

            for result in &results {
                self.emit(ProgressEvent::GateFinished {
                    task_id: task.id.clone(),
                    attempt,
                    gate: result.name.clone(),
                    status: result.status,
                    duration_ms: result.duration_ms,
                    at: Utc::now(),
                });
            }
            let suite = GateSuiteResult::from_results(results);
            self.emit(ProgressEvent::AttemptFinished {
                task_id: task.id.clone(),
                attempt,
                passed: suite.all_passed,
                results: suite.results.clone(),
                at: Utc::now(),
            });

            if suite.all_passed {
                self.complete_task(task).await?;
                self.emit(ProgressEvent::LoopPassed {
                    task_id: task.id.clone(),
                    attempt,
                    at: Utc::now(),
                });
                return Ok(RetryResult::passed(attempt));
            }

            if attempt >= budget {
                warn!(task_id = %task.id, attempt, "Retry budget exhausted");
                self.fail_task(task).await?;
                self.emit(ProgressEvent::MaxRetriesReached {
                    task_id: task.id.clone(),
                    attempt,
                    at: Utc::now(),
                });
                return Ok(RetryResult::exhausted(attempt));
            }

            self.request_fix(task, config, attempt, &suite, cancel).await;
        }
    }

    async fn finish_cancelled(&self, task: &Task, attempt: u32) -> Result<RetryResult> {
        info!(task_id = %task.id, attempt, "Retry loop cancelled");
        self.fail_task(task).await?;
        self.emit(ProgressEvent::LoopCancelled {
            task_id: task.id.clone(),
            attempt,
            at: Utc::now(),
        });
        Ok(RetryResult::cancelled(attempt))
    }

    /// Hand the failed attempt to the agent. Never fails: agent errors,
    /// timeouts and diagnostic collection problems are logged and the next
    /// attempt's gates decide.
    async fn request_fix(
        &self,
        task: &Task,
        config: &RepositoryConfig,
        attempt: u32,
        suite: &GateSuiteResult,
        cancel: &CancellationToken,
    ) {
        let failures: Vec<GateResult> = suite.failures().into_iter().cloned().collect();
        let files = match self.collect_diffs(task, &failures).await {
            Ok(files) => files,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Could not collect changed files");
                Vec::new()
            }
        };

        self.emit(ProgressEvent::FixRequested {
            task_id: task.id.clone(),
            attempt,
            failed_gates: failures.iter().map(|f| f.name.clone()).collect(),
            files: files.len(),
            at: Utc::now(),
        });

        let request = FixRequest {
            task_id: task.id.clone(),
            task_title: task.title.clone(),
            attempt,
            failures,
            files,
        };
        let timeout = self
            .settings
            .agent_timeout
            .unwrap_or_else(|| Duration::from_secs(config.agent.timeout_secs));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatekeeperError::Cancelled {
                task_id: task.id.clone(),
            }),
            res = tokio::time::timeout(timeout, self.agent.fix(&self.settings.repo_path, &request)) => {
                match res {
                    Ok(outcome) => outcome,
                    Err(_) => Err(GatekeeperError::agent(format!(
                        "timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
        };

        let (success, message) = match outcome {
            Ok(outcome) => (outcome.success, outcome.summary),
            Err(e) => {
                warn!(task_id = %task.id, attempt, error = %e, "Fix attempt failed");
                (false, e.to_string())
            }
        };
        self.emit(ProgressEvent::FixFinished {
            task_id: task.id.clone(),
            attempt,
            success,
            message,
            at: Utc::now(),
        });
    }

    async fn collect_diffs(&self, task: &Task, failures: &[GateResult]) -> Result<Vec<FileDiff>> {
        let repo = &self.settings.repo_path;
        let base = task.base_commit_or_head();
        let globs: Vec<&str> = self.settings.exclude_globs.iter().map(String::as_str).collect();

        let changed = ChangeDetector::new(repo)
            .with_exclude_globs(&globs)?
            .changed_since(base)
            .await?;
        let implicated = select_implicated(changed, failures, self.settings.max_implicated_files);

        let mut diffs = Vec::with_capacity(implicated.len());
        for path in implicated {
            match self.content.before_and_after(repo, &path, base).await {
                Ok(diff) => diffs.push(diff.truncated(self.settings.max_file_bytes)),
                Err(e) => debug!(file = %path.display(), error = %e, "Skipping file"),
            }
        }
        Ok(diffs)
    }

    // ------------------------------------------------------------------------
    // Verdicts
    // ------------------------------------------------------------------------

    /// Mark the task completed, then move its plan on.
    ///
    /// Once the task write lands the task stays completed: a plan that cannot
    /// be advanced is left running on it for `plan resume` or the next run.
    async fn complete_task(&self, task: &Task) -> Result<()> {
        self.store
            .transition_task(&task.id, &[TaskStatus::Running], TaskStatus::Completed)
            .await?;

        for attempt in 1..=PLAN_WRITE_ATTEMPTS {
            match self.advance_plan(task).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    task_id = %task.id,
                    plan_id = %task.plan_id,
                    attempt,
                    error = %e,
                    "Could not advance plan after completion"
                ),
            }
        }
        warn!(task_id = %task.id, plan_id = %task.plan_id, "Plan left on completed task");
        Ok(())
    }

    async fn advance_plan(&self, task: &Task) -> Result<()> {
        let Some(plan) = self.store.plan(&task.plan_id).await? else {
            return Ok(());
        };
        let owns_plan = plan
            .current_task_id
            .as_deref()
            .is_none_or(|current| current == task.id);
        if plan.status != PlanStatus::Running || !owns_plan {
            debug!(plan_id = %plan.id, status = %plan.status, "Plan moved on, not advancing");
            return Ok(());
        }

        let tasks = self.store.tasks_for_plan(&plan.id).await?;
        let update = next_plan_state(&tasks);
        self.write_plan(&plan.id, update).await
    }

    async fn fail_task(&self, task: &Task) -> Result<()> {
        match self
            .store
            .transition_task(&task.id, &[TaskStatus::Running], TaskStatus::Failed)
            .await
        {
            Ok(_) => {}
            Err(GatekeeperError::Conflict { actual, .. })
                if actual == TaskStatus::Completed.as_str() =>
            {
                debug!(task_id = %task.id, "Task already completed, leaving plan");
                return Ok(());
            }
            Err(e) if e.is_conflict() => {
                warn!(task_id = %task.id, error = %e, "Task left running state elsewhere");
            }
            Err(e) => return Err(e),
        }

        let Some(plan) = self.store.plan(&task.plan_id).await? else {
            return Ok(());
        };
        if plan.status != PlanStatus::Running {
            return Ok(());
        }
        let update = PlanUpdate::status(PlanStatus::Failed).with_current_task(&task.id);
        self.write_plan(&plan.id, update).await
    }

    /// Conditional plan write from `running`; losing the race is logged.
    async fn write_plan(&self, plan_id: &str, update: PlanUpdate) -> Result<()> {
        match self.store.update_plan(plan_id, PlanStatus::Running, update).await {
            Ok(plan) => {
                info!(
                    plan_id,
                    status = %plan.status,
                    current_task = plan.current_task_id.as_deref().unwrap_or("-"),
                    "Plan updated"
                );
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                warn!(plan_id, error = %e, "Plan changed concurrently, leaving it");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn emit(&self, event: ProgressEvent) {
        self.events.emit(event);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn ensure_plan_startable(plan: &Plan) -> Result<()> {
    match plan.status {
        PlanStatus::Pending | PlanStatus::Paused | PlanStatus::Running => Ok(()),
        PlanStatus::Completed | PlanStatus::Failed => Err(GatekeeperError::InvalidTransition {
            entity: "plan",
            id: plan.id.clone(),
            from: plan.status.to_string(),
            to: PlanStatus::Running.to_string(),
        }),
    }
}

/// Plan state after one of its tasks completes.
///
/// The next pending task becomes current; failing that a still-running one.
/// A plan whose remaining tasks include a failure is failed on that task, and
/// a plan with every task completed is completed with no current task.
fn next_plan_state(tasks: &[Task]) -> PlanUpdate {
    let first = |status: TaskStatus| tasks.iter().find(|t| t.status == status);

    if let Some(next) = first(TaskStatus::Pending).or_else(|| first(TaskStatus::Running)) {
        PlanUpdate::status(PlanStatus::Running).with_current_task(&next.id)
    } else if let Some(failed) = first(TaskStatus::Failed) {
        PlanUpdate::status(PlanStatus::Failed).with_current_task(&failed.id)
    } else {
        PlanUpdate::status(PlanStatus::Completed).clear_current_task()
    }
}

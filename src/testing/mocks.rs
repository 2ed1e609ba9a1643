//! Controllable test doubles for the orchestrator's seams.
//!
//! These mocks are public so integration tests can drive the orchestrator
//! deterministically without real gate commands or a real agent.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::agent::{FixOutcome, FixRequest, FixingAgent};
use crate::config::RepositoryConfig;
use crate::error::{GatekeeperError, Result};
use crate::gates::{GateResult, GateRunner};
use crate::state::{Plan, PlanStatus, PlanUpdate, StateStore, Task, TaskStatus};

// ============================================================================
// Gate runner
// ============================================================================

/// Gate runner that replays scripted results, one entry per attempt.
///
/// Once the script runs out the last entry repeats.
///
/// # Example
///
/// ```rust,ignore
/// let gates = MockGateRunner::failing_then_passing(2);
/// // attempts 1 and 2 fail, attempt 3 passes
/// ```
#[derive(Debug, Default)]
pub struct MockGateRunner {
    script: Vec<Vec<GateResult>>,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl MockGateRunner {
    /// Replay `script`, one suite per call.
    #[must_use]
    pub fn scripted(script: Vec<Vec<GateResult>>) -> Self {
        Self {
            script,
            calls: AtomicU32::new(0),
            delay: None,
        }
    }

    /// Every attempt passes.
    #[must_use]
    pub fn passing() -> Self {
        Self::scripted(vec![passing_suite()])
    }

    /// Every attempt fails.
    #[must_use]
    pub fn failing() -> Self {
        Self::scripted(vec![failing_suite()])
    }

    /// The first `failures` attempts fail, the rest pass.
    #[must_use]
    pub fn failing_then_passing(failures: usize) -> Self {
        let mut script = vec![failing_suite(); failures];
        script.push(passing_suite());
        Self::scripted(script)
    }

    /// Wait `delay` before each suite (observing cancellation).
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of suites run so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GateRunner for MockGateRunner {
    async fn run_gates(
        &self,
        _config: &RepositoryConfig,
        _repo_path: &Path,
        cancel: &CancellationToken,
    ) -> Vec<GateResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return vec![GateResult::failed("test", 0, "cancelled")];
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.script
            .get(call)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or_else(passing_suite)
    }
}

/// Passing `lint` and `test` gates.
#[must_use]
pub fn passing_suite() -> Vec<GateResult> {
    vec![
        GateResult::passed("lint", 3, ""),
        GateResult::passed("test", 10, "test result: ok. 4 passed"),
    ]
}

/// `lint` passes, `test` fails pointing at `src/lib.rs`.
#[must_use]
pub fn failing_suite() -> Vec<GateResult> {
    vec![
        GateResult::passed("lint", 3, ""),
        GateResult::failed(
            "test",
            12,
            "thread 'adds' panicked at src/lib.rs:7:5:\nassertion `left == right` failed",
        ),
    ]
}

// ============================================================================
// Fixing agent
// ============================================================================

#[derive(Debug, Clone)]
enum AgentBehavior {
    Report(bool),
    Error(String),
}

/// Fixing agent that records requests and reports a configured outcome.
#[derive(Debug)]
pub struct MockFixingAgent {
    behavior: AgentBehavior,
    delay: Option<Duration>,
    write: Option<(PathBuf, String)>,
    calls: AtomicU32,
    requests: Mutex<Vec<FixRequest>>,
}

impl Default for MockFixingAgent {
    fn default() -> Self {
        Self {
            behavior: AgentBehavior::Report(true),
            delay: None,
            write: None,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl MockFixingAgent {
    /// Agent that always reports success.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `success` from every call.
    #[must_use]
    pub fn with_success(mut self, success: bool) -> Self {
        self.behavior = AgentBehavior::Report(success);
        self
    }

    /// Fail every call with an agent error.
    #[must_use]
    pub fn with_error(mut self, message: &str) -> Self {
        self.behavior = AgentBehavior::Error(message.to_string());
        self
    }

    /// Sleep before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Write `content` to `relative_path` in the repository on each call.
    #[must_use]
    pub fn writing(mut self, relative_path: impl Into<PathBuf>, content: &str) -> Self {
        self.write = Some((relative_path.into(), content.to_string()));
        self
    }

    /// Number of fix calls so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<FixRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FixingAgent for MockFixingAgent {
    async fn fix(&self, repo_path: &Path, request: &FixRequest) -> Result<FixOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((path, content)) = &self.write {
            tokio::fs::write(repo_path.join(path), content).await?;
        }

        match &self.behavior {
            AgentBehavior::Report(success) => Ok(FixOutcome {
                success: *success,
                summary: format!("mock fix for attempt {}", request.attempt),
            }),
            AgentBehavior::Error(message) => Err(GatekeeperError::agent(message.clone())),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Store wrapper whose plan updates (and optionally task listings) fail for
/// selected plans.
pub struct FailingStore {
    inner: Arc<dyn StateStore>,
    failing_plans: HashSet<String>,
    failing_listings: HashSet<String>,
}

impl FailingStore {
    /// Wrap `inner`, failing `update_plan` for every id in `plan_ids`.
    pub fn new(inner: Arc<dyn StateStore>, plan_ids: &[&str]) -> Self {
        Self {
            inner,
            failing_plans: plan_ids.iter().map(|id| (*id).to_string()).collect(),
            failing_listings: HashSet::new(),
        }
    }

    /// Also fail `tasks_for_plan` for every id in `plan_ids`.
    pub fn with_failing_task_listings(mut self, plan_ids: &[&str]) -> Self {
        self.failing_listings = plan_ids.iter().map(|id| (*id).to_string()).collect();
        self
    }
}

#[async_trait]
impl StateStore for FailingStore {
    async fn task(&self, task_id: &str) -> Result<Option<Task>> {
        self.inner.task(task_id).await
    }

    async fn plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        self.inner.plan(plan_id).await
    }

    async fn tasks_for_plan(&self, plan_id: &str) -> Result<Vec<Task>> {
        if self.failing_listings.contains(plan_id) {
            return Err(GatekeeperError::store(format!(
                "injected read failure for plan {plan_id}"
            )));
        }
        self.inner.tasks_for_plan(plan_id).await
    }

    async fn recent_plans(&self, status: Option<PlanStatus>, limit: usize) -> Result<Vec<Plan>> {
        self.inner.recent_plans(status, limit).await
    }

    async fn insert_plan(&self, plan: Plan, tasks: Vec<Task>) -> Result<()> {
        self.inner.insert_plan(plan, tasks).await
    }

    async fn transition_task(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<Task> {
        self.inner.transition_task(task_id, expected, to).await
    }

    async fn record_attempt(&self, task_id: &str, attempt: u32) -> Result<Task> {
        self.inner.record_attempt(task_id, attempt).await
    }

    async fn update_plan(
        &self,
        plan_id: &str,
        expected: PlanStatus,
        update: PlanUpdate,
    ) -> Result<Plan> {
        if self.failing_plans.contains(plan_id) {
            return Err(GatekeeperError::store(format!(
                "injected write failure for plan {plan_id}"
            )));
        }
        self.inner.update_plan(plan_id, expected, update).await
    }
}

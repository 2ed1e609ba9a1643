//! Gate execution.
//!
//! A gate is one configured command (lint, build, test, ...) run against a
//! checkout. [`ShellGateRunner`] executes every configured gate in order and
//! always runs the full suite, so one attempt yields a complete diagnostic
//! picture. Process failures, timeouts and execution-environment errors are
//! captured as failed [`GateResult`]s and never returned as errors.
//!
//! # Example
//!
//! ```rust,ignore
//! use gatekeeper::gates::{run_qa_gates, GateSuiteResult};
//!
//! let results = run_qa_gates(&config, Path::new("/path/to/repo")).await;
//! let suite = GateSuiteResult::from_results(results);
//! if !suite.all_passed {
//!     for failure in suite.failures() {
//!         eprintln!("{}", failure.summary());
//!     }
//! }
//! ```

pub mod sandbox;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{GateDescriptor, RepositoryConfig};
pub use sandbox::{IdentityTranslator, PathTranslator, PrefixTranslator};

/// Maximum bytes of captured output kept per gate (the tail is kept).
pub const MAX_GATE_OUTPUT_BYTES: usize = 32 * 1024;

/// Outcome of a single gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
    Skipped,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result from running one gate during one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    /// Gate name from the configuration.
    pub name: String,
    pub status: GateStatus,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
    /// Captured stdout/stderr, or the error text.
    pub output: String,
}

impl GateResult {
    /// A passing result.
    pub fn passed(name: impl Into<String>, duration_ms: u64, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: GateStatus::Passed,
            duration_ms,
            output: output.into(),
        }
    }

    /// A failing result.
    pub fn failed(name: impl Into<String>, duration_ms: u64, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: GateStatus::Failed,
            duration_ms,
            output: output.into(),
        }
    }

    /// A skipped result.
    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: GateStatus::Skipped,
            duration_ms: 0,
            output: reason.into(),
        }
    }

    /// Whether this result blocks the attempt.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status == GateStatus::Failed
    }

    /// One-line summary for display.
    #[must_use]
    pub fn summary(&self) -> String {
        let icon = match self.status {
            GateStatus::Passed => "✅",
            GateStatus::Failed => "❌",
            GateStatus::Skipped => "⏭️",
        };
        format!(
            "{} {} ({}, {}ms)",
            icon, self.name, self.status, self.duration_ms
        )
    }
}

/// Summary of all gate results for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSuiteResult {
    pub results: Vec<GateResult>,
    /// Every non-skipped gate passed.
    pub all_passed: bool,
    pub total_duration_ms: u64,
}

impl GateSuiteResult {
    /// Aggregate per-gate results.
    #[must_use]
    pub fn from_results(results: Vec<GateResult>) -> Self {
        let all_passed = results.iter().all(|r| !r.is_failure());
        let total_duration_ms = results.iter().map(|r| r.duration_ms).sum();
        Self {
            results,
            all_passed,
            total_duration_ms,
        }
    }

    /// Only the failing results.
    #[must_use]
    pub fn failures(&self) -> Vec<&GateResult> {
        self.results.iter().filter(|r| r.is_failure()).collect()
    }
}

/// Executes a configured gate suite against a checkout.
#[async_trait]
pub trait GateRunner: Send + Sync {
    /// Run every configured gate in order.
    ///
    /// Never fails: every problem is folded into a failed [`GateResult`].
    /// Cancelling `cancel` terminates the in-flight gate process.
    async fn run_gates(
        &self,
        config: &RepositoryConfig,
        repo_path: &Path,
        cancel: &CancellationToken,
    ) -> Vec<GateResult>;
}

/// Runs gates as local subprocesses.
#[derive(Debug, Clone)]
pub struct ShellGateRunner {
    translator: Arc<dyn PathTranslator>,
}

impl Default for ShellGateRunner {
    fn default() -> Self {
        Self::new(Arc::new(IdentityTranslator))
    }
}

impl ShellGateRunner {
    /// Runner that resolves repository paths through `translator`.
    #[must_use]
    pub fn new(translator: Arc<dyn PathTranslator>) -> Self {
        Self { translator }
    }

    fn build_command(gate: &GateDescriptor, cwd: &Path) -> Command {
        let mut cmd = if gate.args.is_empty() {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&gate.command);
            cmd
        } else {
            let mut cmd = Command::new(&gate.command);
            cmd.args(&gate.args);
            cmd
        };
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so descendants can be killed with the gate.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Run a single gate.
    pub async fn run_gate(
        &self,
        gate: &GateDescriptor,
        sandbox_repo: &Path,
        cancel: &CancellationToken,
    ) -> GateResult {
        if !gate.enabled {
            return GateResult::skipped(&gate.name, "gate disabled in configuration");
        }

        let cwd = match &gate.working_dir {
            Some(dir) => sandbox_repo.join(dir),
            None => sandbox_repo.to_path_buf(),
        };
        let timeout = Duration::from_secs(gate.timeout_secs);
        let start = Instant::now();
        debug!(gate = %gate.name, command = %gate.display_command(), "Running gate");

        let child = match Self::build_command(gate, &cwd).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(gate = %gate.name, error = %e, "Gate failed to start");
                return GateResult::failed(
                    &gate.name,
                    elapsed_ms(start),
                    format!("failed to start `{}`: {}", gate.display_command(), e),
                );
            }
        };

        // Dropping the wait future drops the child, and kill_on_drop
        // terminates the process on timeout or cancellation. The guard then
        // takes down anything the gate left behind in its process group.
        let _group = ProcessGroupGuard::new(child.id());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return GateResult::failed(&gate.name, elapsed_ms(start), "cancelled");
            }
            res = tokio::time::timeout(timeout, child.wait_with_output()) => res,
        };
        let duration_ms = elapsed_ms(start);

        match result {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                let text = truncate_tail(&text, MAX_GATE_OUTPUT_BYTES);

                if output.status.success() {
                    GateResult::passed(&gate.name, duration_ms, text)
                } else {
                    let code = output
                        .status
                        .code()
                        .map_or_else(|| "signal".to_string(), |c| c.to_string());
                    debug!(gate = %gate.name, exit = %code, "Gate failed");
                    GateResult::failed(&gate.name, duration_ms, text)
                }
            }
            Ok(Err(e)) => GateResult::failed(
                &gate.name,
                duration_ms,
                format!("failed to collect output: {e}"),
            ),
            Err(_elapsed) => {
                warn!(gate = %gate.name, timeout_secs = gate.timeout_secs, "Gate timed out");
                GateResult::failed(
                    &gate.name,
                    duration_ms,
                    format!("timed out after {}s", gate.timeout_secs),
                )
            }
        }
    }
}

/// Kills a gate's whole process group when dropped.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; an empty group yields ESRCH.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        debug!(pgid, "Killed gate process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

#[async_trait]
impl GateRunner for ShellGateRunner {
    async fn run_gates(
        &self,
        config: &RepositoryConfig,
        repo_path: &Path,
        cancel: &CancellationToken,
    ) -> Vec<GateResult> {
        let sandbox_repo = match self.translator.to_sandbox(repo_path) {
            Ok(path) => path,
            Err(e) => {
                warn!(repo = %repo_path.display(), error = %e, "Path translation failed");
                return config
                    .qa_gates
                    .iter()
                    .map(|gate| {
                        if gate.enabled {
                            GateResult::failed(&gate.name, 0, format!("execution environment error: {e}"))
                        } else {
                            GateResult::skipped(&gate.name, "gate disabled in configuration")
                        }
                    })
                    .collect();
            }
        };

        let mut results = Vec::with_capacity(config.qa_gates.len());
        for gate in &config.qa_gates {
            results.push(self.run_gate(gate, &sandbox_repo, cancel).await);
        }

        let failed = results.iter().filter(|r| r.is_failure()).count();
        info!(
            repo = %repo_path.display(),
            gates = results.len(),
            failed,
            "Gate suite finished"
        );
        results
    }
}

/// Run the configured gates against `repo_path` with default settings.
pub async fn run_qa_gates(config: &RepositoryConfig, repo_path: &Path) -> Vec<GateResult> {
    ShellGateRunner::default()
        .run_gates(config, repo_path, &CancellationToken::new())
        .await
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Keep at most `max_bytes` from the end of `text`, on a char boundary.
pub(crate) fn truncate_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("... (output truncated)\n{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateDescriptor;
    use tempfile::TempDir;

    fn config(gates: Vec<GateDescriptor>) -> RepositoryConfig {
        RepositoryConfig {
            qa_gates: gates,
            ..RepositoryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_passing_and_failing_gates() {
        let temp = TempDir::new().unwrap();
        let config = config(vec![
            GateDescriptor::shell("ok", "echo all good"),
            GateDescriptor::shell("bad", "echo broken >&2; exit 3"),
        ]);

        let results = run_qa_gates(&config, temp.path()).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, GateStatus::Passed);
        assert!(results[0].output.contains("all good"));
        assert_eq!(results[1].status, GateStatus::Failed);
        assert!(results[1].output.contains("broken"));
    }

    #[tokio::test]
    async fn test_no_short_circuit() {
        let temp = TempDir::new().unwrap();
        let config = config(vec![
            GateDescriptor::shell("first", "exit 1"),
            GateDescriptor::shell("second", "touch ran-second"),
        ]);

        let results = run_qa_gates(&config, temp.path()).await;
        assert_eq!(results[0].status, GateStatus::Failed);
        assert_eq!(results[1].status, GateStatus::Passed);
        assert!(temp.path().join("ran-second").exists());
    }

    #[tokio::test]
    async fn test_timeout_is_failed_result() {
        let temp = TempDir::new().unwrap();
        let config = config(vec![GateDescriptor::shell("slow", "sleep 5").with_timeout_secs(1)]);

        let results = run_qa_gates(&config, temp.path()).await;
        assert_eq!(results[0].status, GateStatus::Failed);
        assert!(results[0].output.contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn test_missing_program_is_failed_result() {
        let temp = TempDir::new().unwrap();
        let config = config(vec![GateDescriptor::shell(
            "ghost",
            "definitely-not-a-real-binary-xyz",
        )
        .with_args(&["--version"])]);

        let results = run_qa_gates(&config, temp.path()).await;
        assert_eq!(results[0].status, GateStatus::Failed);
        assert!(results[0].output.contains("failed to start"));
    }

    #[tokio::test]
    async fn test_disabled_gate_is_skipped() {
        let temp = TempDir::new().unwrap();
        let config = config(vec![
            GateDescriptor::shell("off", "exit 1").with_enabled(false),
            GateDescriptor::shell("on", "true"),
        ]);

        let results = run_qa_gates(&config, temp.path()).await;
        assert_eq!(results[0].status, GateStatus::Skipped);
        assert!(GateSuiteResult::from_results(results).all_passed);
    }

    #[tokio::test]
    async fn test_cancellation_stops_running_gate() {
        let temp = TempDir::new().unwrap();
        let config = config(vec![GateDescriptor::shell("long", "sleep 30")]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let results = ShellGateRunner::default()
            .run_gates(&config, temp.path(), &cancel)
            .await;
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(results[0].status, GateStatus::Failed);
        assert_eq!(results[0].output, "cancelled");
    }

    /// Whether any process on the host still runs a command line containing
    /// `marker`, polling briefly so killed processes can be reaped.
    #[cfg(unix)]
    async fn still_running(marker: &str) -> bool {
        for _ in 0..20 {
            let listing = std::process::Command::new("ps")
                .args(["-eo", "args"])
                .output()
                .unwrap();
            let listing = String::from_utf8_lossy(&listing.stdout);
            if !listing.lines().any(|line| line.contains(marker)) {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        true
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_gate_descendants() {
        let temp = TempDir::new().unwrap();
        let config = config(vec![
            GateDescriptor::shell("slow", "sleep 3701; echo done").with_timeout_secs(1),
        ]);

        let results = run_qa_gates(&config, temp.path()).await;
        assert!(results[0].output.contains("timed out after 1s"));
        assert!(!still_running("sleep 3701").await, "gate descendant survived timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_kills_gate_descendants() {
        let temp = TempDir::new().unwrap();
        let config = config(vec![GateDescriptor::shell("long", "sleep 3702; echo done")]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let results = ShellGateRunner::default()
            .run_gates(&config, temp.path(), &cancel)
            .await;
        assert_eq!(results[0].output, "cancelled");
        assert!(!still_running("sleep 3702").await, "gate descendant survived cancel");
    }

    #[tokio::test]
    async fn test_translation_error_fails_enabled_gates() {
        let runner = ShellGateRunner::new(Arc::new(PrefixTranslator::new("/host", "/sandbox")));
        let config = config(vec![
            GateDescriptor::shell("a", "true"),
            GateDescriptor::shell("b", "true").with_enabled(false),
        ]);
        let results = runner
            .run_gates(&config, Path::new("/elsewhere"), &CancellationToken::new())
            .await;
        assert_eq!(results[0].status, GateStatus::Failed);
        assert!(results[0].output.contains("execution environment error"));
        assert_eq!(results[1].status, GateStatus::Skipped);
    }

    #[test]
    fn test_suite_aggregation() {
        let suite = GateSuiteResult::from_results(vec![
            GateResult::passed("a", 10, ""),
            GateResult::failed("b", 5, "boom"),
            GateResult::skipped("c", "off"),
        ]);
        assert!(!suite.all_passed);
        assert_eq!(suite.total_duration_ms, 15);
        assert_eq!(suite.failures().len(), 1);
        assert_eq!(suite.failures()[0].name, "b");
    }

    #[test]
    fn test_truncate_tail_keeps_end() {
        let text = "a".repeat(100) + "END";
        let truncated = truncate_tail(&text, 10);
        assert!(truncated.ends_with("END"));
        assert!(truncated.starts_with("... (output truncated)"));
        assert_eq!(truncate_tail("short", 10), "short");
    }
}

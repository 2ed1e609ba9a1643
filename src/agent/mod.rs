//! The fixing agent seam.
//!
//! After a failed attempt the orchestrator hands the agent a [`FixRequest`]
//! describing what failed and which files are implicated, and waits for it to
//! edit the working tree. Whether the agent reports success or not, the next
//! attempt's gates are the only judge of the result.

pub mod prompt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::changes::FileDiff;
use crate::config::AgentConfig;
use crate::error::{GatekeeperError, Result};
use crate::gates::{GateResult, IdentityTranslator, PathTranslator};
use prompt::{render_fix_prompt, PromptLimits};

/// Diagnostics handed to the agent after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRequest {
    pub task_id: String,
    pub task_title: String,
    /// The attempt that just failed.
    pub attempt: u32,
    /// Failing gate results only.
    pub failures: Vec<GateResult>,
    /// Before/after content of implicated files.
    pub files: Vec<FileDiff>,
}

/// What the agent reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixOutcome {
    pub success: bool,
    pub summary: String,
}

/// Applies fixes to a working tree.
#[async_trait]
pub trait FixingAgent: Send + Sync {
    /// Attempt to fix the failures described by `request` in `repo_path`.
    ///
    /// # Errors
    ///
    /// Returns an `Agent` error when the agent cannot be invoked at all.
    async fn fix(&self, repo_path: &Path, request: &FixRequest) -> Result<FixOutcome>;
}

/// Runs an external program with the rendered prompt on stdin.
///
/// The process is killed if the returned future is dropped, which is how the
/// orchestrator enforces its timeout and cancellation.
#[derive(Debug, Clone)]
pub struct CommandFixingAgent {
    config: AgentConfig,
    limits: PromptLimits,
    translator: Arc<dyn PathTranslator>,
}

impl CommandFixingAgent {
    /// Agent invoked as described by `config`.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            limits: PromptLimits::default(),
            translator: Arc::new(IdentityTranslator),
        }
    }

    /// Resolve repository paths through `translator`.
    #[must_use]
    pub fn with_translator(mut self, translator: Arc<dyn PathTranslator>) -> Self {
        self.translator = translator;
        self
    }

    /// Override prompt size limits.
    #[must_use]
    pub fn with_limits(mut self, limits: PromptLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Whether the configured program can be found on `PATH`.
    #[must_use]
    pub fn available(&self) -> bool {
        which::which(&self.config.command).is_ok()
    }
}

#[async_trait]
impl FixingAgent for CommandFixingAgent {
    async fn fix(&self, repo_path: &Path, request: &FixRequest) -> Result<FixOutcome> {
        let program = which::which(&self.config.command).map_err(|_| {
            GatekeeperError::agent(format!(
                "'{}' is not installed or not in PATH",
                self.config.command
            ))
        })?;
        let cwd = self.translator.to_sandbox(repo_path)?;
        let prompt = render_fix_prompt(request, &self.limits);

        debug!(
            task_id = %request.task_id,
            attempt = request.attempt,
            chars = prompt.len(),
            "Invoking fixing agent"
        );

        let mut child = Command::new(program)
            .args(&self.config.args)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatekeeperError::agent(format!("failed to spawn agent: {e}")))?;

        // The prompt is written while output is drained, so an agent that
        // talks before it reads cannot fill its pipe and stall the write.
        let stdin = child.stdin.take();
        let write_prompt = async {
            let Some(mut stdin) = stdin else {
                return Ok::<(), GatekeeperError>(());
            };
            match stdin.write_all(prompt.as_bytes()).await {
                Ok(()) => Ok(()),
                // The agent may exit without reading its prompt.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(task_id = %request.task_id, "Agent closed stdin early");
                    Ok(())
                }
                Err(e) => Err(GatekeeperError::agent(format!("failed to write prompt: {e}"))),
            }
            // Dropping stdin sends EOF.
        };

        let (written, output) = tokio::join!(write_prompt, child.wait_with_output());
        written?;
        let output =
            output.map_err(|e| GatekeeperError::agent(format!("failed to read output: {e}")))?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(FixOutcome {
                success: true,
                summary: last_line(&stdout).unwrap_or("agent finished").to_string(),
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            Ok(FixOutcome {
                success: false,
                summary: match last_line(&stderr) {
                    Some(line) => format!("exit {code}: {line}"),
                    None => format!("exit {code}"),
                },
            })
        }
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|l| !l.is_empty())
}

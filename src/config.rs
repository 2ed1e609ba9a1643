//! Repository configuration for the gate suite and the fixing agent.
//!
//! Configuration is resolved per repository from `.gatekeeper/config.toml`
//! or `.gatekeeper/config.json`. A repository without either file gets
//! [`RepositoryConfig::default`]. Every loaded file is validated before it is
//! returned, so malformed gate descriptors surface as a typed
//! [`GatekeeperError::InvalidConfig`] at load time rather than mid-loop.
//!
//! # Example
//!
//! ```rust,ignore
//! use gatekeeper::config::RepositoryConfig;
//!
//! let config = RepositoryConfig::load(Path::new("/path/to/repo"))?;
//! for gate in &config.qa_gates {
//!     println!("{} -> {}", gate.name, gate.display_command());
//! }
//! ```

pub mod validation;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{GatekeeperError, Result};

pub use validation::{collect_issues, validate, ConfigIssue};

/// Directory holding per-repository Gatekeeper files.
pub const CONFIG_DIR: &str = ".gatekeeper";

/// TOML configuration file name (checked first).
pub const CONFIG_TOML: &str = "config.toml";

/// JSON configuration file name.
pub const CONFIG_JSON: &str = "config.json";

/// The only configuration schema version understood by this build.
pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

/// Default retry budget when neither the task nor the file sets one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-gate timeout in seconds.
pub const DEFAULT_GATE_TIMEOUT_SECS: u64 = 300;

/// Default fixing-agent timeout in seconds.
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 600;

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_gate_timeout_secs() -> u64 {
    DEFAULT_GATE_TIMEOUT_SECS
}

fn default_agent_timeout_secs() -> u64 {
    DEFAULT_AGENT_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

/// A single configured gate.
///
/// When `args` is empty, `command` is treated as a shell line and run through
/// `sh -c`. Otherwise `command` is the program and `args` its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDescriptor {
    /// Unique gate name (e.g. "lint").
    pub name: String,
    /// Program or shell line to run.
    pub command: String,
    /// Program arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Timeout for a single run of this gate.
    #[serde(default = "default_gate_timeout_secs")]
    pub timeout_secs: u64,
    /// Disabled gates are reported as skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Working directory relative to the repository root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl GateDescriptor {
    /// Create a shell-line gate with default timeout.
    pub fn shell(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            timeout_secs: DEFAULT_GATE_TIMEOUT_SECS,
            enabled: true,
            working_dir: None,
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set program arguments, switching the gate to direct execution.
    #[must_use]
    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| (*a).to_string()).collect();
        self
    }

    /// Enable or disable the gate.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Human-readable form of the invocation.
    #[must_use]
    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// How the external fixing agent is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Program that receives the diagnostic prompt on stdin.
    pub command: String,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Upper bound on a single fix invocation.
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["-p".to_string()],
            timeout_secs: DEFAULT_AGENT_TIMEOUT_SECS,
        }
    }
}

/// Per-repository configuration consumed read-only by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// Schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Default retry budget for tasks that carry none of their own.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Gates in execution order.
    #[serde(default)]
    pub qa_gates: Vec<GateDescriptor>,
    /// Fixing agent invocation.
    #[serde(default)]
    pub agent: AgentConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            version: SUPPORTED_CONFIG_VERSION,
            max_retries: DEFAULT_MAX_RETRIES,
            qa_gates: vec![
                GateDescriptor::shell("lint", "cargo clippy --all-targets -- -D warnings"),
                GateDescriptor::shell("build", "cargo build --all-targets"),
                GateDescriptor::shell("test", "cargo test"),
            ],
            agent: AgentConfig::default(),
        }
    }
}

impl RepositoryConfig {
    /// Load and validate the configuration for a repository.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if a file exists but cannot be read or
    /// parsed, and `InvalidConfig` if it parses but fails validation.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let dir = repo_path.join(CONFIG_DIR);
        let toml_path = dir.join(CONFIG_TOML);
        let json_path = dir.join(CONFIG_JSON);

        if toml_path.exists() {
            Self::load_from_path(&toml_path)
        } else if json_path.exists() {
            Self::load_from_path(&json_path)
        } else {
            debug!(repo = %repo_path.display(), "No repository config, using defaults");
            Ok(Self::default())
        }
    }

    /// Load and validate a specific configuration file.
    ///
    /// The format is chosen by extension (`.toml`, otherwise JSON).
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatekeeperError::config_with_path(format!("cannot read: {e}"), path.to_path_buf())
        })?;

        let is_toml = path.extension().is_some_and(|ext| ext == "toml");
        let parsed: Self = if is_toml {
            toml::from_str(&content).map_err(|e| {
                GatekeeperError::config_with_path(e.to_string(), path.to_path_buf())
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| {
                GatekeeperError::config_with_path(e.to_string(), path.to_path_buf())
            })?
        };

        validate(&parsed)?;
        debug!(
            path = %path.display(),
            gates = parsed.qa_gates.len(),
            max_retries = parsed.max_retries,
            "Loaded repository config"
        );
        Ok(parsed)
    }

    /// Gates that will actually execute.
    pub fn enabled_gates(&self) -> impl Iterator<Item = &GateDescriptor> {
        self.qa_gates.iter().filter(|g| g.enabled)
    }

    /// Resolve the retry budget for a task.
    ///
    /// A task-level budget wins over the repository default. The result is
    /// never below one so every loop runs at least one attempt.
    #[must_use]
    pub fn effective_budget(&self, task_max_attempts: Option<u32>) -> u32 {
        task_max_attempts.unwrap_or(self.max_retries).max(1)
    }
}

/// Supplies the repository configuration at the start of each loop.
pub trait ConfigLoader: Send + Sync {
    /// Load a validated configuration for `repo_path`.
    fn load_config(&self, repo_path: &Path) -> Result<RepositoryConfig>;
}

/// Reads `.gatekeeper/config.toml` or `config.json` from the repository.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileConfigLoader;

impl ConfigLoader for FileConfigLoader {
    fn load_config(&self, repo_path: &Path) -> Result<RepositoryConfig> {
        RepositoryConfig::load(repo_path)
    }
}

/// A fixed configuration, validated on every load.
impl ConfigLoader for RepositoryConfig {
    fn load_config(&self, _repo_path: &Path) -> Result<RepositoryConfig> {
        validate(self)?;
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let config_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        let path = config_dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = RepositoryConfig::default();
        assert_eq!(config.version, 1);
        assert_eq!(config.max_retries, 3);
        let names: Vec<_> = config.qa_gates.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["lint", "build", "test"]);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_load_missing_file_yields_default() {
        let temp = TempDir::new().unwrap();
        let config = RepositoryConfig::load(temp.path()).unwrap();
        assert_eq!(config, RepositoryConfig::default());
    }

    #[test]
    fn test_load_json() {
        let temp = TempDir::new().unwrap();
        write_config(
            &temp,
            CONFIG_JSON,
            r#"{
                "version": 1,
                "maxRetries": 5,
                "qaGates": [
                    { "name": "fmt", "command": "cargo fmt --check" },
                    { "name": "unit", "command": "cargo", "args": ["test", "--lib"], "timeoutSecs": 30 }
                ]
            }"#,
        );

        let config = RepositoryConfig::load(temp.path()).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.qa_gates.len(), 2);
        assert_eq!(config.qa_gates[0].timeout_secs, DEFAULT_GATE_TIMEOUT_SECS);
        assert_eq!(config.qa_gates[1].args, vec!["test", "--lib"]);
        assert_eq!(config.qa_gates[1].timeout_secs, 30);
        assert_eq!(config.agent, AgentConfig::default());
    }

    #[test]
    fn test_load_toml_preferred_over_json() {
        let temp = TempDir::new().unwrap();
        write_config(
            &temp,
            CONFIG_JSON,
            r#"{ "maxRetries": 9, "qaGates": [{ "name": "a", "command": "true" }] }"#,
        );
        write_config(
            &temp,
            CONFIG_TOML,
            r#"
version = 1
maxRetries = 2

[[qaGates]]
name = "check"
command = "make check"
enabled = false

[agent]
command = "fixer"
args = ["--stdin"]
timeoutSecs = 60
"#,
        );

        let config = RepositoryConfig::load(temp.path()).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.qa_gates[0].name, "check");
        assert!(!config.qa_gates[0].enabled);
        assert_eq!(config.agent.command, "fixer");
        assert_eq!(config.agent.timeout_secs, 60);
        assert_eq!(config.enabled_gates().count(), 0);
    }

    #[test]
    fn test_load_malformed_is_config_error() {
        let temp = TempDir::new().unwrap();
        write_config(&temp, CONFIG_JSON, "{ not json");
        let err = RepositoryConfig::load(temp.path()).unwrap_err();
        assert!(matches!(err, GatekeeperError::Config { path: Some(_), .. }));
    }

    #[test]
    fn test_load_invalid_is_typed_error() {
        let temp = TempDir::new().unwrap();
        write_config(
            &temp,
            CONFIG_JSON,
            r#"{ "maxRetries": 3, "qaGates": [{ "name": "", "command": "true" }] }"#,
        );
        let err = RepositoryConfig::load(temp.path()).unwrap_err();
        assert!(matches!(err, GatekeeperError::InvalidConfig { .. }));
    }

    #[test]
    fn test_effective_budget() {
        let config = RepositoryConfig::default();
        assert_eq!(config.effective_budget(None), 3);
        assert_eq!(config.effective_budget(Some(7)), 7);
        assert_eq!(config.effective_budget(Some(0)), 1);
    }

    #[test]
    fn test_fixed_loader_validates() {
        let temp = TempDir::new().unwrap();
        let fixed = RepositoryConfig::default();
        assert_eq!(fixed.load_config(temp.path()).unwrap(), fixed);

        let broken = RepositoryConfig {
            qa_gates: Vec::new(),
            ..RepositoryConfig::default()
        };
        assert!(broken.load_config(temp.path()).is_err());
    }

    #[test]
    fn test_display_command() {
        let shell = GateDescriptor::shell("lint", "npm run lint");
        assert_eq!(shell.display_command(), "npm run lint");
        let direct = GateDescriptor::shell("test", "cargo").with_args(&["test", "-q"]);
        assert_eq!(direct.display_command(), "cargo test -q");
    }
}

//! Schema validation for repository configuration.
//!
//! Validation runs once at load time. Every problem found is reported as a
//! [`ConfigIssue`]; [`validate`] turns the first one into a typed error.

use std::collections::HashSet;

use super::{RepositoryConfig, SUPPORTED_CONFIG_VERSION};
use crate::error::{GatekeeperError, Result};

/// Upper bound on a configured retry budget.
pub const MAX_RETRY_BUDGET: u32 = 20;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Dotted path of the offending field (e.g. `qaGates[1].command`).
    pub field: String,
    /// What is wrong with it.
    pub reason: String,
}

impl ConfigIssue {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Collect every validation issue in `config`.
#[must_use]
pub fn collect_issues(config: &RepositoryConfig) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();

    if config.version != SUPPORTED_CONFIG_VERSION {
        issues.push(ConfigIssue::new(
            "version",
            format!(
                "unsupported version {} (expected {})",
                config.version, SUPPORTED_CONFIG_VERSION
            ),
        ));
    }

    if config.max_retries == 0 || config.max_retries > MAX_RETRY_BUDGET {
        issues.push(ConfigIssue::new(
            "maxRetries",
            format!("must be between 1 and {MAX_RETRY_BUDGET}"),
        ));
    }

    if config.qa_gates.is_empty() {
        issues.push(ConfigIssue::new("qaGates", "at least one gate is required"));
    }

    let mut seen = HashSet::new();
    for (i, gate) in config.qa_gates.iter().enumerate() {
        let prefix = format!("qaGates[{i}]");
        let name = gate.name.trim();

        if name.is_empty() {
            issues.push(ConfigIssue::new(format!("{prefix}.name"), "must not be empty"));
        } else if !seen.insert(name.to_string()) {
            issues.push(ConfigIssue::new(
                format!("{prefix}.name"),
                format!("duplicate gate name '{name}'"),
            ));
        }

        if gate.command.trim().is_empty() {
            issues.push(ConfigIssue::new(
                format!("{prefix}.command"),
                "must not be empty",
            ));
        }

        if gate.timeout_secs == 0 {
            issues.push(ConfigIssue::new(
                format!("{prefix}.timeoutSecs"),
                "must be greater than zero",
            ));
        }

        if let Some(dir) = &gate.working_dir {
            if dir.is_absolute() || dir.components().any(|c| c.as_os_str() == "..") {
                issues.push(ConfigIssue::new(
                    format!("{prefix}.workingDir"),
                    "must be a relative path inside the repository",
                ));
            }
        }
    }

    if config.agent.command.trim().is_empty() {
        issues.push(ConfigIssue::new("agent.command", "must not be empty"));
    }
    if config.agent.timeout_secs == 0 {
        issues.push(ConfigIssue::new(
            "agent.timeoutSecs",
            "must be greater than zero",
        ));
    }

    issues
}

/// Validate `config`, failing on the first issue.
///
/// # Errors
///
/// Returns [`GatekeeperError::InvalidConfig`] naming the offending field.
pub fn validate(config: &RepositoryConfig) -> Result<()> {
    match collect_issues(config).into_iter().next() {
        Some(issue) => Err(GatekeeperError::invalid_config(issue.field, issue.reason)),
        None => Ok(()),
    }
}

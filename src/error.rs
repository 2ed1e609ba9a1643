//! Custom error types for Gatekeeper.
//!
//! This module provides structured error types that separate request-level
//! problems (missing task, loop already running) from internal faults, so the
//! trigger boundary can report each one appropriately.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Gatekeeper operations
#[derive(Error, Debug)]
pub enum GatekeeperError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // State Errors
    // =========================================================================
    /// Referenced task does not exist
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Referenced plan does not exist
    #[error("Plan not found: {plan_id}")]
    PlanNotFound { plan_id: String },

    /// A retry loop already owns this task
    #[error("Task {task_id} already has an active retry loop")]
    TaskAlreadyRunning { task_id: String },

    /// Status change not permitted by the state machine
    #[error("Invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// Conditional write lost against a concurrent writer
    #[error("Conflicting write on {entity} {id}: expected {expected}, found {actual}")]
    Conflict {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    /// Store backend failure
    #[error("State store error: {message}")]
    Store { message: String },

    // =========================================================================
    // Loop Execution Errors
    // =========================================================================
    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// Fixing agent could not be invoked or reported failure
    #[error("Fixing agent failed: {message}")]
    Agent { message: String },

    /// Loop was cancelled before reaching a verdict
    #[error("Retry loop for task {task_id} was cancelled")]
    Cancelled { task_id: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// TOML error wrapper
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatekeeperError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a task-not-found error
    pub fn task_not_found(task_id: impl Into<String>) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    /// Create a plan-not-found error
    pub fn plan_not_found(plan_id: impl Into<String>) -> Self {
        Self::PlanNotFound {
            plan_id: plan_id.into(),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an agent error
    pub fn agent(message: impl Into<String>) -> Self {
        Self::Agent {
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error describes a problem with the request itself rather
    /// than an internal fault.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound { .. }
                | Self::PlanNotFound { .. }
                | Self::TaskAlreadyRunning { .. }
                | Self::InvalidTransition { .. }
        )
    }

    /// Check if this error came from losing a compare-and-swap
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::TaskAlreadyRunning { .. })
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        if self.is_request_error() {
            2
        } else {
            3
        }
    }
}

/// Type alias for Gatekeeper results
pub type Result<T> = std::result::Result<T, GatekeeperError>;

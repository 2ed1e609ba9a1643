//! Gatekeeper - bounded fix-and-retry loops behind quality gates
//!
//! Gatekeeper runs a repository's configured quality gates against an
//! agent-authored change. When a gate fails it hands the failure output and
//! the implicated files to a fixing agent, then re-runs the gates, until they
//! pass or the retry budget is spent. Task and plan state is kept consistent
//! under concurrent triggers, and a reconciler repairs plans left stuck in a
//! failed state.
//!
//! # Architecture
//!
//! - [`config`] - Per-repository gate and agent configuration
//! - [`gates`] - Gate execution with timeouts and cancellation
//! - [`changes`] - Changed-file detection and before/after content
//! - [`agent`] - The fixing agent seam and its prompt
//! - [`state`] - Task and plan state machine with conditional writes
//! - [`orchestrator`] - The retry loop and background supervision
//! - [`reconciler`] - Repair of stuck plans
//! - [`service`] - Trigger boundary mapping outcomes to responses
//! - [`events`] - Structured progress events
//! - [`error`] - Error types
//! - [`testing`] - Mocks and fixtures
//!
//! # Example
//!
//! ```rust,ignore
//! use gatekeeper::{FileStore, OrchestratorConfig, RetryOrchestrator, ShellGateRunner};
//! use gatekeeper::agent::CommandFixingAgent;
//!
//! let store = Arc::new(FileStore::for_repo(repo));
//! let config = RepositoryConfig::load(repo)?;
//! let orchestrator = RetryOrchestrator::new(
//!     store,
//!     Arc::new(ShellGateRunner::default()),
//!     Arc::new(CommandFixingAgent::new(config.agent)),
//!     OrchestratorConfig::new(repo),
//! );
//! let result = orchestrator.run_with_retry("task-1").await?;
//! println!("passed={} after {} attempts", result.passed, result.attempt);
//! ```

pub mod agent;
pub mod changes;
pub mod config;
pub mod error;
pub mod events;
pub mod gates;
pub mod orchestrator;
pub mod reconciler;
pub mod service;
pub mod state;
pub mod testing;

pub use error::{GatekeeperError, Result};

pub use config::{AgentConfig, ConfigLoader, FileConfigLoader, GateDescriptor, RepositoryConfig};

pub use gates::{
    run_qa_gates, GateResult, GateRunner, GateStatus, GateSuiteResult, PathTranslator,
    ShellGateRunner,
};

pub use changes::{select_implicated, ChangeDetector, ContentProvider, FileDiff};

pub use agent::{CommandFixingAgent, FixOutcome, FixRequest, FixingAgent};

pub use state::{FileStore, MemoryStore, Plan, PlanStatus, StateStore, Task, TaskStatus};

pub use orchestrator::{
    LoopHandle, LoopOutcome, OrchestratorConfig, RetryOrchestrator, RetryResult,
};

pub use reconciler::{ReconciliationReport, ReconciliationResult, Reconciler};

pub use service::{QaService, TriggerResponse};

pub use events::{EventSink, ProgressEvent};

#[cfg(test)]
pub use testing::TestFixture;

//! Progress events emitted by retry loops.
//!
//! Events carry enough to reconstruct a loop from the outside: task id,
//! attempt number, each gate's name and status, and the final outcome.
//! Sinks never fail; a sink with no listeners simply drops events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::gates::{GateResult, GateStatus};

/// Current schema version for serialized events.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// A single progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    LoopStarted {
        task_id: String,
        plan_id: String,
        budget: u32,
        at: DateTime<Utc>,
    },
    AttemptStarted {
        task_id: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    GateFinished {
        task_id: String,
        attempt: u32,
        gate: String,
        status: GateStatus,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    AttemptFinished {
        task_id: String,
        attempt: u32,
        passed: bool,
        results: Vec<GateResult>,
        at: DateTime<Utc>,
    },
    FixRequested {
        task_id: String,
        attempt: u32,
        failed_gates: Vec<String>,
        files: usize,
        at: DateTime<Utc>,
    },
    FixFinished {
        task_id: String,
        attempt: u32,
        success: bool,
        message: String,
        at: DateTime<Utc>,
    },
    LoopPassed {
        task_id: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    MaxRetriesReached {
        task_id: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    LoopCancelled {
        task_id: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    LoopErrored {
        task_id: String,
        message: String,
        at: DateTime<Utc>,
    },
}

impl ProgressEvent {
    /// Task the event belongs to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::LoopStarted { task_id, .. }
            | Self::AttemptStarted { task_id, .. }
            | Self::GateFinished { task_id, .. }
            | Self::AttemptFinished { task_id, .. }
            | Self::FixRequested { task_id, .. }
            | Self::FixFinished { task_id, .. }
            | Self::LoopPassed { task_id, .. }
            | Self::MaxRetriesReached { task_id, .. }
            | Self::LoopCancelled { task_id, .. }
            | Self::LoopErrored { task_id, .. } => task_id,
        }
    }

    /// Serialized `type` tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoopStarted { .. } => "loop_started",
            Self::AttemptStarted { .. } => "attempt_started",
            Self::GateFinished { .. } => "gate_finished",
            Self::AttemptFinished { .. } => "attempt_finished",
            Self::FixRequested { .. } => "fix_requested",
            Self::FixFinished { .. } => "fix_finished",
            Self::LoopPassed { .. } => "loop_passed",
            Self::MaxRetriesReached { .. } => "max_retries_reached",
            Self::LoopCancelled { .. } => "loop_cancelled",
            Self::LoopErrored { .. } => "loop_errored",
        }
    }

    /// Whether this event ends a loop.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::LoopPassed { .. }
                | Self::MaxRetriesReached { .. }
                | Self::LoopCancelled { .. }
                | Self::LoopErrored { .. }
        )
    }
}

/// Receives progress events.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: ProgressEvent);
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::GateFinished {
                task_id,
                attempt,
                gate,
                status,
                ..
            } => info!(task_id = %task_id, attempt, gate = %gate, status = %status, "gate finished"),
            ProgressEvent::MaxRetriesReached { task_id, attempt, .. } => {
                warn!(task_id = %task_id, attempt, "max retries reached")
            }
            ProgressEvent::LoopErrored { task_id, message, .. } => {
                warn!(task_id = %task_id, error = %message, "loop errored")
            }
            other => info!(task_id = %other.task_id(), event = other.kind(), "progress"),
        }
    }
}

/// In-process fan-out to live subscribers over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastEventSink {
    /// Create a sink with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to subsequent events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: ProgressEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

/// Forwards each event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: ProgressEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Keeps every event in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingEventSink {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// `type` tags of recorded events, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(ProgressEvent::kind).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

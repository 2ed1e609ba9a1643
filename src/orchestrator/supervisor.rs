//! Supervision of background retry loops.
//!
//! Every loop, foreground or background, holds a [`LoopGuard`] in the
//! [`LoopRegistry`] for its lifetime. The registry rejects a second loop for
//! the same task within this process and lets callers cancel a loop by task
//! id. Cross-process exclusion comes from the store's conditional claim.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::RetryResult;
use crate::error::{GatekeeperError, Result};

/// Handle to a retry loop running on the tokio runtime.
#[derive(Debug)]
pub struct LoopHandle {
    task_id: String,
    cancel: CancellationToken,
    join: JoinHandle<Result<RetryResult>>,
}

impl LoopHandle {
    pub(crate) fn new(
        task_id: String,
        cancel: CancellationToken,
        join: JoinHandle<Result<RetryResult>>,
    ) -> Self {
        Self {
            task_id,
            cancel,
            join,
        }
    }

    /// Task this loop is driving.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Request cancellation. The loop stops at its next checkpoint and any
    /// in-flight gate or agent process is terminated.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token observed by the loop.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the loop has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop's verdict.
    ///
    /// # Errors
    ///
    /// Returns the loop's own error, or `Cancelled` if the runtime aborted
    /// the loop before it finished.
    pub async fn join(self) -> Result<RetryResult> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(GatekeeperError::Cancelled {
                task_id: self.task_id,
            }),
            Err(e) => Err(GatekeeperError::Other(anyhow::anyhow!(
                "retry loop for task {} panicked: {e}",
                self.task_id
            ))),
        }
    }
}

/// Tracks the loops active in this process.
#[derive(Debug, Clone, Default)]
pub struct LoopRegistry {
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl LoopRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `task_id`; `None` if a loop for it is already active.
    #[must_use]
    pub fn register(&self, task_id: &str) -> Option<LoopGuard> {
        let mut active = self.entries();
        if active.contains_key(task_id) {
            return None;
        }
        let token = CancellationToken::new();
        active.insert(task_id.to_string(), token.clone());
        debug!(task_id, "Registered retry loop");
        Some(LoopGuard {
            registry: self.clone(),
            task_id: task_id.to_string(),
            token,
        })
    }

    /// Cancel the loop for `task_id`. Returns whether one was active.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.entries().get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active loop, returning how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let active = self.entries();
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    /// Whether a loop for `task_id` is active.
    #[must_use]
    pub fn is_active(&self, task_id: &str) -> bool {
        self.entries().contains_key(task_id)
    }

    /// Task ids with an active loop, sorted.
    #[must_use]
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        // A poisoned map is still a valid map.
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Registration of one active loop; released on drop.
#[derive(Debug)]
pub struct LoopGuard {
    registry: LoopRegistry,
    task_id: String,
    token: CancellationToken,
}

impl LoopGuard {
    /// Cancellation token for this loop.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.registry.entries().remove(&self.task_id);
        debug!(task_id = %self.task_id, "Released retry loop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::LoopOutcome;

    #[test]
    fn test_register_is_exclusive() {
        let registry = LoopRegistry::new();
        let guard = registry.register("t1").unwrap();
        assert!(registry.register("t1").is_none());
        assert!(registry.is_active("t1"));

        drop(guard);
        assert!(!registry.is_active("t1"));
        assert!(registry.register("t1").is_some());
    }

    #[test]
    fn test_cancel_by_task_id() {
        let registry = LoopRegistry::new();
        let guard = registry.register("t1").unwrap();
        assert!(!guard.token().is_cancelled());

        assert!(registry.cancel("t1"));
        assert!(guard.token().is_cancelled());
        assert!(!registry.cancel("unknown"));
    }

    #[test]
    fn test_cancel_all_and_listing() {
        let registry = LoopRegistry::new();
        let b = registry.register("b").unwrap();
        let a = registry.register("a").unwrap();
        assert_eq!(registry.active(), vec!["a", "b"]);
        assert_eq!(registry.cancel_all(), 2);
        assert!(a.token().is_cancelled() && b.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_handle_join_and_abort() {
        let token = CancellationToken::new();
        let join = tokio::spawn(async {
            Ok(RetryResult {
                passed: true,
                attempt: 1,
                outcome: LoopOutcome::Passed,
            })
        });
        let handle = LoopHandle::new("t1".into(), token, join);
        assert_eq!(handle.task_id(), "t1");
        assert!(handle.join().await.unwrap().passed);

        let join = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(RetryResult {
                passed: true,
                attempt: 1,
                outcome: LoopOutcome::Passed,
            })
        });
        join.abort();
        let handle = LoopHandle::new("t2".into(), CancellationToken::new(), join);
        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, GatekeeperError::Cancelled { .. }));
    }
}

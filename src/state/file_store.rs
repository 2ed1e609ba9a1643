//! File-backed store used by the CLI.
//!
//! The whole graph lives in one JSON document. Every operation takes an
//! `fs2` lock on a sibling lock file (shared for reads, exclusive for
//! read-modify-write) so that separate processes observe each conditional
//! write atomically. Writes go through a temp file and a rename.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;

use super::store::{PlanUpdate, StateDocument, StateStore};
use super::{Plan, PlanStatus, Task, TaskStatus};
use crate::config::CONFIG_DIR;
use crate::error::{GatekeeperError, Result};

/// Default state file name inside [`CONFIG_DIR`].
pub const STATE_FILE: &str = "state.json";

const TMP_SUFFIX: &str = ".tmp";
const LOCK_SUFFIX: &str = ".lock";

/// JSON document store guarded by an advisory file lock.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Store at an explicit path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Store at the default location for a repository.
    #[must_use]
    pub fn for_repo(repo_path: &Path) -> Self {
        Self::new(repo_path.join(CONFIG_DIR).join(STATE_FILE))
    }

    /// Path of the JSON document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(LOCK_SUFFIX);
        PathBuf::from(name)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(TMP_SUFFIX);
        PathBuf::from(name)
    }

    fn open_lock(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        Ok(file)
    }

    fn load_unlocked(&self) -> Result<StateDocument> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(StateDocument::default()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_unlocked(&self, doc: &StateDocument) -> Result<()> {
        let tmp_path = self.tmp_path();
        let json = serde_json::to_string_pretty(doc)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Read the document under a shared lock.
    pub fn read_document(&self) -> Result<StateDocument> {
        let lock = self.open_lock()?;
        FileExt::lock_shared(&lock)
            .map_err(|e| GatekeeperError::store(format!("Failed to acquire state lock: {e}")))?;
        let doc = self.load_unlocked();
        let _ = FileExt::unlock(&lock);
        doc
    }

    /// Run a read-modify-write under an exclusive lock.
    ///
    /// The document is only written back when `f` succeeds.
    pub fn modify<T>(&self, f: impl FnOnce(&mut StateDocument) -> Result<T>) -> Result<T> {
        let lock = self.open_lock()?;
        FileExt::lock_exclusive(&lock)
            .map_err(|e| GatekeeperError::store(format!("Failed to acquire state lock: {e}")))?;

        let result = self.load_unlocked().and_then(|mut doc| {
            let value = f(&mut doc)?;
            self.save_unlocked(&doc)?;
            Ok(value)
        });

        let _ = FileExt::unlock(&lock);
        result
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(FileStore) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| GatekeeperError::store(format!("state store task failed: {e}")))?
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn task(&self, task_id: &str) -> Result<Option<Task>> {
        let task_id = task_id.to_string();
        self.blocking(move |s| Ok(s.read_document()?.task(&task_id).cloned()))
            .await
    }

    async fn plan(&self, plan_id: &str) -> Result<Option<Plan>> {
        let plan_id = plan_id.to_string();
        self.blocking(move |s| Ok(s.read_document()?.plan(&plan_id).cloned()))
            .await
    }

    async fn tasks_for_plan(&self, plan_id: &str) -> Result<Vec<Task>> {
        let plan_id = plan_id.to_string();
        self.blocking(move |s| Ok(s.read_document()?.tasks_for_plan(&plan_id)))
            .await
    }

    async fn recent_plans(&self, status: Option<PlanStatus>, limit: usize) -> Result<Vec<Plan>> {
        self.blocking(move |s| Ok(s.read_document()?.recent_plans(status, limit)))
            .await
    }

    async fn insert_plan(&self, plan: Plan, tasks: Vec<Task>) -> Result<()> {
        self.blocking(move |s| s.modify(|doc| doc.insert_plan(plan, tasks)))
            .await
    }

    async fn transition_task(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        to: TaskStatus,
    ) -> Result<Task> {
        let task_id = task_id.to_string();
        let expected = expected.to_vec();
        self.blocking(move |s| s.modify(|doc| doc.transition_task(&task_id, &expected, to)))
            .await
    }

    async fn record_attempt(&self, task_id: &str, attempt: u32) -> Result<Task> {
        let task_id = task_id.to_string();
        self.blocking(move |s| s.modify(|doc| doc.record_attempt(&task_id, attempt)))
            .await
    }

    async fn update_plan(
        &self,
        plan_id: &str,
        expected: PlanStatus,
        update: PlanUpdate,
    ) -> Result<Plan> {
        let plan_id = plan_id.to_string();
        self.blocking(move |s| s.modify(|doc| doc.update_plan(&plan_id, expected, update)))
            .await
    }
}

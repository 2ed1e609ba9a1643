//! File content at a commit and in the working tree.
//!
//! All git and filesystem access goes through the sandbox path produced by a
//! [`PathTranslator`]; callers pass host-visible repository paths.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::git_stdout;
use crate::error::{GatekeeperError, Result};
use crate::gates::{IdentityTranslator, PathTranslator};

/// Before/after text for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    /// Path relative to the repository root.
    pub path: PathBuf,
    /// Content at the base commit; empty for new files.
    pub before: String,
    /// Working-tree content, or `HEAD` content if the file is gone.
    pub after: String,
}

impl FileDiff {
    /// The file did not exist at the base commit.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.before.is_empty() && !self.after.is_empty()
    }

    /// Both sides are identical.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.before == self.after
    }

    /// Cap each side at `max_bytes`, keeping the head of the file.
    #[must_use]
    pub fn truncated(self, max_bytes: usize) -> Self {
        Self {
            path: self.path,
            before: truncate_head(self.before, max_bytes),
            after: truncate_head(self.after, max_bytes),
        }
    }
}

fn truncate_head(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str("\n... (file truncated)\n");
    text
}

/// Resolves file contents for diff construction.
#[derive(Debug, Clone)]
pub struct ContentProvider {
    translator: Arc<dyn PathTranslator>,
}

impl Default for ContentProvider {
    fn default() -> Self {
        Self::new(Arc::new(IdentityTranslator))
    }
}

impl ContentProvider {
    /// Provider that reaches the repository through `translator`.
    #[must_use]
    pub fn new(translator: Arc<dyn PathTranslator>) -> Self {
        Self { translator }
    }

    /// Content of `file_path` as recorded at `commit`.
    ///
    /// A file that did not exist at `commit` yields an empty string.
    ///
    /// # Errors
    ///
    /// Returns a git error if `commit` does not resolve or git fails.
    pub async fn file_content(&self, repo_path: &Path, file_path: &Path, commit: &str) -> Result<String> {
        let repo = self.translator.to_sandbox(repo_path)?;
        let rel = relative_path(file_path)?;

        let commit_ref = format!("{commit}^{{commit}}");
        git_stdout(&repo, &["rev-parse", "--verify", "--quiet", &commit_ref], "rev-parse")
            .await
            .map_err(|_| GatekeeperError::git("rev-parse", format!("unknown commit '{commit}'")))?;

        let object = format!("{commit}:{rel}");
        // `cat-file -e` exits nonzero when the path is absent at that commit.
        if git_stdout(&repo, &["cat-file", "-e", &object], "cat-file")
            .await
            .is_err()
        {
            debug!(file = %rel, commit, "File absent at commit");
            return Ok(String::new());
        }

        git_stdout(&repo, &["show", &object], "show").await
    }

    /// Content at `from_commit` and the current content.
    ///
    /// The current side prefers the working tree so uncommitted edits are
    /// visible, falling back to `HEAD` when the file is missing on disk.
    pub async fn before_and_after(
        &self,
        repo_path: &Path,
        file_path: &Path,
        from_commit: &str,
    ) -> Result<FileDiff> {
        let before = self.file_content(repo_path, file_path, from_commit).await?;

        let sandbox_repo = self.translator.to_sandbox(repo_path)?;
        let on_disk = sandbox_repo.join(relative_path(file_path)?);
        let after = match tokio::fs::read(&on_disk).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.file_content(repo_path, file_path, "HEAD").await?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(FileDiff {
            path: file_path.to_path_buf(),
            before,
            after,
        })
    }
}

/// Render a repository-relative path with forward slashes, rejecting paths
/// that escape the repository.
fn relative_path(file_path: &Path) -> Result<String> {
    if file_path.is_absolute() || file_path.components().any(|c| c.as_os_str() == "..") {
        return Err(GatekeeperError::git(
            "show",
            format!("{} is not inside the repository", file_path.display()),
        ));
    }
    let parts: Vec<String> = file_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFixture;

    #[tokio::test]
    async fn test_file_content_at_commit() {
        let fixture = TestFixture::with_git_repo();
        fixture.write_file("src/lib.rs", "pub fn v1() {}\n").unwrap();
        fixture.make_commit("v1");
        let v1 = fixture.get_commit_hash();
        fixture.write_file("src/lib.rs", "pub fn v2() {}\n").unwrap();
        fixture.make_commit("v2");

        let provider = ContentProvider::default();
        let content = provider
            .file_content(fixture.path(), Path::new("src/lib.rs"), &v1)
            .await
            .unwrap();
        assert_eq!(content, "pub fn v1() {}\n");
    }

    #[tokio::test]
    async fn test_file_absent_at_commit_is_empty() {
        let fixture = TestFixture::with_git_repo();
        let base = fixture.get_commit_hash();
        fixture.write_file("added.rs", "fn new() {}").unwrap();
        fixture.make_commit("add");

        let content = ContentProvider::default()
            .file_content(fixture.path(), Path::new("added.rs"), &base)
            .await
            .unwrap();
        assert_eq!(content, "");
    }

    #[tokio::test]
    async fn test_unknown_commit_is_error() {
        let fixture = TestFixture::with_git_repo();
        let result = ContentProvider::default()
            .file_content(fixture.path(), Path::new("README.md"), "deadbeefdeadbeef")
            .await;
        assert!(matches!(result, Err(GatekeeperError::Git { .. })));
    }

    #[tokio::test]
    async fn test_before_and_after_uses_working_tree() {
        let fixture = TestFixture::with_git_repo();
        let base = fixture.get_commit_hash();
        fixture.write_file("README.md", "# Edited, not committed\n").unwrap();

        let diff = ContentProvider::default()
            .before_and_after(fixture.path(), Path::new("README.md"), &base)
            .await
            .unwrap();
        assert_eq!(diff.before, "# Fixture\n");
        assert_eq!(diff.after, "# Edited, not committed\n");
        assert!(!diff.is_new());
    }

    #[tokio::test]
    async fn test_before_and_after_new_file() {
        let fixture = TestFixture::with_git_repo();
        let base = fixture.get_commit_hash();
        fixture.write_file("brand_new.rs", "fn x() {}").unwrap();

        let diff = ContentProvider::default()
            .before_and_after(fixture.path(), Path::new("brand_new.rs"), &base)
            .await
            .unwrap();
        assert!(diff.is_new());
    }

    #[tokio::test]
    async fn test_deleted_file_falls_back_to_head() {
        let fixture = TestFixture::with_git_repo();
        let base = fixture.get_commit_hash();
        std::fs::remove_file(fixture.path().join("README.md")).unwrap();

        let diff = ContentProvider::default()
            .before_and_after(fixture.path(), Path::new("README.md"), &base)
            .await
            .unwrap();
        assert_eq!(diff.after, "# Fixture\n");
        assert!(diff.is_unchanged());
    }

    #[test]
    fn test_truncated_keeps_head() {
        let diff = FileDiff {
            path: PathBuf::from("big.txt"),
            before: "short".into(),
            after: format!("HEAD{}", "z".repeat(100)),
        }
        .truncated(8);
        assert_eq!(diff.before, "short");
        assert!(diff.after.starts_with("HEADzzzz\n... (file truncated)"));
    }

    #[test]
    fn test_relative_path_rejects_escape() {
        assert!(relative_path(Path::new("../etc/passwd")).is_err());
        assert!(relative_path(Path::new("/abs")).is_err());
        assert_eq!(relative_path(Path::new("a/b.rs")).unwrap(), "a/b.rs");
    }
}

//! Test fixtures for creating reproducible repositories.

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use crate::config::{RepositoryConfig, CONFIG_DIR, CONFIG_JSON};

/// A temporary directory, optionally initialized as a git repository.
///
/// Automatically cleans up when dropped.
///
/// # Example
///
/// ```rust,ignore
/// let fixture = TestFixture::with_git_repo();
/// let base = fixture.get_commit_hash();
/// fixture.write_file("src/lib.rs", "pub fn f() {}")?;
/// ```
pub struct TestFixture {
    temp_dir: TempDir,
    is_git_repo: bool,
}

impl TestFixture {
    /// An empty directory.
    ///
    /// # Panics
    ///
    /// Panics if temporary directory creation fails.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
            is_git_repo: false,
        }
    }

    /// A git repository with `README.md` (`# Fixture\n`) in one commit.
    ///
    /// # Panics
    ///
    /// Panics if git initialization fails.
    #[must_use]
    pub fn with_git_repo() -> Self {
        let mut fixture = Self::empty();
        fixture
            .write_file("README.md", "# Fixture\n")
            .expect("Failed to write README.md");

        fixture.git(&["init", "--quiet"]);
        fixture.git(&["config", "user.email", "test@example.com"]);
        fixture.git(&["config", "user.name", "Test User"]);
        fixture.git(&["config", "commit.gpgsign", "false"]);
        fixture.git(&["add", "."]);
        fixture.git(&["commit", "--quiet", "-m", "Initial commit"]);

        fixture.is_git_repo = true;
        fixture
    }

    /// Write `config` to `.gatekeeper/config.json`.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn write_config(&self, config: &RepositoryConfig) {
        let json = serde_json::to_string_pretty(config).expect("Failed to serialize config");
        self.write_file(&format!("{CONFIG_DIR}/{CONFIG_JSON}"), &json)
            .expect("Failed to write config");
    }

    /// Path to the fixture directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Owned path to the fixture directory.
    #[must_use]
    pub fn path_buf(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    /// Write a file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_file(&self, relative_path: &str, content: &str) -> std::io::Result<()> {
        let path = self.temp_dir.path().join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    /// Read a file from the fixture directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read_file(&self, relative_path: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.temp_dir.path().join(relative_path))
    }

    /// Stage everything and commit.
    ///
    /// # Panics
    ///
    /// Panics if not a git repo.
    pub fn make_commit(&self, message: &str) {
        assert!(self.is_git_repo, "Not a git repository");
        self.git(&["add", "."]);
        self.git(&["commit", "--quiet", "--allow-empty", "-m", message]);
    }

    /// Current `HEAD` commit hash.
    ///
    /// # Panics
    ///
    /// Panics if not a git repo or git fails.
    #[must_use]
    pub fn get_commit_hash(&self) -> String {
        assert!(self.is_git_repo, "Not a git repository");
        self.git(&["rev-parse", "HEAD"])
    }

    fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.temp_dir.path())
            .output()
            .expect("Failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_git_repo_has_initial_commit() {
        let fixture = TestFixture::with_git_repo();
        assert!(fixture.path().join(".git").exists());
        assert_eq!(fixture.get_commit_hash().len(), 40);
        assert_eq!(fixture.read_file("README.md").unwrap(), "# Fixture\n");
    }

    #[test]
    fn test_make_commit_moves_head() {
        let fixture = TestFixture::with_git_repo();
        let before = fixture.get_commit_hash();
        fixture.write_file("nested/dir/file.txt", "x").unwrap();
        fixture.make_commit("Add file");
        assert_ne!(fixture.get_commit_hash(), before);
    }

    #[test]
    fn test_write_config_is_loadable() {
        let fixture = TestFixture::empty();
        let config = RepositoryConfig {
            max_retries: 7,
            ..RepositoryConfig::default()
        };
        fixture.write_config(&config);
        assert_eq!(RepositoryConfig::load(fixture.path()).unwrap(), config);
    }
}

//! Change detection and file content resolution for fix diagnostics.
//!
//! [`ChangeDetector`] lists the files touched since a task's base commit
//! (committed, staged, unstaged and untracked). [`select_implicated`]
//! narrows that list to the files the failing gates actually mention, and
//! [`ContentProvider`](content::ContentProvider) supplies before/after text
//! for each of them.
//!
//! # Example
//!
//! ```rust,ignore
//! use gatekeeper::changes::{ChangeDetector, select_implicated};
//!
//! let detector = ChangeDetector::new("/path/to/repo").with_exclude_globs(&["*.lock"])?;
//! let changed = detector.changed_since("abc123").await?;
//! let files = select_implicated(changed, &failures, 20);
//! ```

pub mod content;

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::process::Command;

use crate::error::{GatekeeperError, Result};
use crate::gates::GateResult;

pub use content::{ContentProvider, FileDiff};

/// Run `git` in `repo` and return stdout, failing on a nonzero exit.
pub(crate) async fn git_stdout(repo: &Path, args: &[&str], operation: &str) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .map_err(|e| GatekeeperError::git(operation, e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GatekeeperError::git(operation, stderr.trim().to_string()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Lists files changed in a git working tree relative to a commit.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    repo_path: PathBuf,
    exclude: Option<GlobSet>,
}

impl ChangeDetector {
    /// Detector for the repository at `repo_path`.
    #[must_use]
    pub fn new<P: AsRef<Path>>(repo_path: P) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
            exclude: None,
        }
    }

    /// Skip files matching any of `patterns` (e.g. lockfiles).
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid glob.
    pub fn with_exclude_globs(mut self, patterns: &[&str]) -> Result<Self> {
        if patterns.is_empty() {
            self.exclude = None;
            return Ok(self);
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                GatekeeperError::invalid_config("excludeGlobs", format!("{pattern}: {e}"))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| GatekeeperError::invalid_config("excludeGlobs", e.to_string()))?;
        self.exclude = Some(set);
        Ok(self)
    }

    /// Files that differ between `commit` and the working tree, plus
    /// untracked files, in git's order and without duplicates.
    ///
    /// # Errors
    ///
    /// Returns a git error if the path is not a repository or the commit
    /// does not resolve.
    pub async fn changed_since(&self, commit: &str) -> Result<Vec<PathBuf>> {
        let diff = git_stdout(
            &self.repo_path,
            &["diff", "--name-status", "-z", "--diff-filter=ACDMR", "-M", commit],
            "diff",
        )
        .await?;
        let untracked = git_stdout(
            &self.repo_path,
            &["ls-files", "-z", "--others", "--exclude-standard"],
            "ls-files",
        )
        .await?;

        let mut files = self.parse_name_status(&diff);
        for file in self.parse_file_list(&untracked) {
            if !files.contains(&file) {
                files.push(file);
            }
        }
        Ok(files)
    }

    /// Parse `git diff --name-status -z` output.
    ///
    /// Fields are NUL-terminated: a status, then one path, or two for renames
    /// and copies (which report the new path). Paths are taken verbatim.
    fn parse_name_status(&self, output: &str) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut fields = output.split('\0').filter(|f| !f.is_empty());
        while let Some(status) = fields.next() {
            let path = if status.starts_with('R') || status.starts_with('C') {
                fields.next();
                fields.next()
            } else {
                fields.next()
            };
            let Some(path) = path else {
                break;
            };
            let path = PathBuf::from(path);
            if self.keeps(&path) && !files.contains(&path) {
                files.push(path);
            }
        }
        files
    }

    /// Parse NUL-terminated `git ls-files -z` output.
    fn parse_file_list(&self, output: &str) -> Vec<PathBuf> {
        output
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .filter(|p| self.keeps(p))
            .collect()
    }

    fn keeps(&self, path: &Path) -> bool {
        self.exclude.as_ref().is_none_or(|set| !set.is_match(path))
    }
}

/// Path-like tokens, optionally followed by `:line[:col]`.
const PATH_TOKEN_PATTERN: &str = r"[A-Za-z0-9_@.+\-]*(?:/[A-Za-z0-9_@.+\-]+)*\.[A-Za-z0-9]+";

static PATH_TOKEN: OnceLock<Option<Regex>> = OnceLock::new();

/// File paths mentioned in gate output, with any leading `./` removed.
fn mentioned_paths(output: &str) -> Option<HashSet<String>> {
    let re = PATH_TOKEN
        .get_or_init(|| Regex::new(PATH_TOKEN_PATTERN).ok())
        .as_ref()?;
    Some(
        re.find_iter(output)
            .map(|m| m.as_str().trim_start_matches("./").to_string())
            .collect(),
    )
}

fn is_mentioned(path: &str, mentions: Option<&HashSet<String>>, output: &str) -> bool {
    match mentions {
        Some(tokens) => tokens
            .iter()
            .any(|t| t == path || t.ends_with(&format!("/{path}"))),
        None => output.contains(path),
    }
}

/// Narrow `changed` to files mentioned in failing gate output.
///
/// A file counts as mentioned when a path token in the output equals it or
/// ends with it (absolute paths reported by compilers). When no failing
/// output names any changed file, every changed file is considered
/// implicated. At most `limit` files are returned.
#[must_use]
pub fn select_implicated(changed: Vec<PathBuf>, failures: &[GateResult], limit: usize) -> Vec<PathBuf> {
    let outputs: Vec<(&str, Option<HashSet<String>>)> = failures
        .iter()
        .filter(|f| f.is_failure())
        .map(|f| (f.output.as_str(), mentioned_paths(&f.output)))
        .collect();

    let mentioned: Vec<PathBuf> = changed
        .iter()
        .filter(|path| {
            let needle = path.to_string_lossy().replace('\\', "/");
            outputs
                .iter()
                .any(|(output, tokens)| is_mentioned(&needle, tokens.as_ref(), output))
        })
        .cloned()
        .collect();

    let mut selected = if mentioned.is_empty() { changed } else { mentioned };
    selected.truncate(limit);
    selected
}

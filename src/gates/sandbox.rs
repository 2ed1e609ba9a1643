//! Host-to-sandbox path translation.
//!
//! Gates and git commands run inside an execution environment that may see
//! the repository at a different path than the host. The translation itself
//! belongs to the sandboxing layer; this module only defines the seam.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use crate::error::{GatekeeperError, Result};

/// Maps a host-visible repository path into the execution environment.
pub trait PathTranslator: Send + Sync + Debug {
    /// Translate `host_path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the path cannot be represented in the sandbox.
    fn to_sandbox(&self, host_path: &Path) -> Result<PathBuf>;
}

/// Host and sandbox share a filesystem view.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTranslator;

impl PathTranslator for IdentityTranslator {
    fn to_sandbox(&self, host_path: &Path) -> Result<PathBuf> {
        Ok(host_path.to_path_buf())
    }
}

/// Rewrites a host prefix to a sandbox mount point.
#[derive(Debug, Clone)]
pub struct PrefixTranslator {
    host_prefix: PathBuf,
    sandbox_prefix: PathBuf,
}

impl PrefixTranslator {
    /// `host_prefix` on the host is mounted at `sandbox_prefix`.
    pub fn new(host_prefix: impl Into<PathBuf>, sandbox_prefix: impl Into<PathBuf>) -> Self {
        Self {
            host_prefix: host_prefix.into(),
            sandbox_prefix: sandbox_prefix.into(),
        }
    }
}

impl PathTranslator for PrefixTranslator {
    fn to_sandbox(&self, host_path: &Path) -> Result<PathBuf> {
        let relative = host_path.strip_prefix(&self.host_prefix).map_err(|_| {
            GatekeeperError::config(format!(
                "{} is outside the sandbox mount {}",
                host_path.display(),
                self.host_prefix.display()
            ))
        })?;
        Ok(self.sandbox_prefix.join(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let path = Path::new("/work/repo");
        assert_eq!(IdentityTranslator.to_sandbox(path).unwrap(), path);
    }

    #[test]
    fn test_prefix_rewrite() {
        let translator = PrefixTranslator::new("/home/dev/projects", "/workspace");
        let mapped = translator
            .to_sandbox(Path::new("/home/dev/projects/api"))
            .unwrap();
        assert_eq!(mapped, PathBuf::from("/workspace/api"));
    }

    #[test]
    fn test_prefix_outside_mount() {
        let translator = PrefixTranslator::new("/home/dev/projects", "/workspace");
        assert!(translator.to_sandbox(Path::new("/etc")).is_err());
    }
}

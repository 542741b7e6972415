//! Version-control collaborator interface and an in-memory backend.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::VcsError;

/// Backend that owns the working tree behind each integration line.
///
/// Implementations must leave the tree unchanged whenever a method returns
/// an error.
pub trait VersionControl: Send + Sync {
    /// Make sure the integration line exists.
    fn ensure_line(&self, line: &str) -> Result<(), VcsError>;

    /// Dry-run the patch against the line without touching the tree.
    fn check_patch(&self, line: &str, patch: &str) -> Result<(), VcsError>;

    /// Apply and commit in one step, returning the new commit reference.
    fn apply_and_commit(&self, line: &str, patch: &str, message: &str) -> Result<String, VcsError>;

    /// Commits on the line, oldest first.
    fn commits(&self, line: &str) -> Result<Vec<String>, VcsError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCommit {
    pub commit_ref: String,
    pub message: String,
    pub patch: String,
}

/// Records commits in memory without a working tree. Useful for dry runs
/// and for exercising the supervisor without git.
#[derive(Debug, Default)]
pub struct InMemoryVcs {
    lines: Mutex<HashMap<String, Vec<MemoryCommit>>>,
    failures: Mutex<Vec<VcsError>>,
}

impl InMemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error returned by the next `apply_and_commit`.
    pub fn fail_next(&self, err: VcsError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(err);
        }
    }

    pub fn line_commits(&self, line: &str) -> Vec<MemoryCommit> {
        self.lines
            .lock()
            .ok()
            .and_then(|lines| lines.get(line).cloned())
            .unwrap_or_default()
    }

    fn poisoned() -> VcsError {
        VcsError::command("lock", "in-memory backend lock poisoned")
    }
}

impl VersionControl for InMemoryVcs {
    fn ensure_line(&self, line: &str) -> Result<(), VcsError> {
        let mut lines = self.lines.lock().map_err(|_| Self::poisoned())?;
        lines.entry(line.to_string()).or_default();
        Ok(())
    }

    fn check_patch(&self, _line: &str, patch: &str) -> Result<(), VcsError> {
        if patch.trim().is_empty() {
            return Err(VcsError::PatchRejected {
                message: "empty patch".to_string(),
            });
        }
        Ok(())
    }

    fn apply_and_commit(&self, line: &str, patch: &str, message: &str) -> Result<String, VcsError> {
        if let Some(err) = self
            .failures
            .lock()
            .map_err(|_| Self::poisoned())?
            .pop()
        {
            return Err(err);
        }
        let mut lines = self.lines.lock().map_err(|_| Self::poisoned())?;
        let commits = lines.entry(line.to_string()).or_default();
        let commit_ref = format!("mem-{}-{:04}", line.replace('/', "-"), commits.len() + 1);
        commits.push(MemoryCommit {
            commit_ref: commit_ref.clone(),
            message: message.to_string(),
            patch: patch.to_string(),
        });
        Ok(commit_ref)
    }

    fn commits(&self, line: &str) -> Result<Vec<String>, VcsError> {
        let lines = self.lines.lock().map_err(|_| Self::poisoned())?;
        Ok(lines
            .get(line)
            .map(|c| c.iter().map(|m| m.commit_ref.clone()).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_commits_in_order() {
        let vcs = InMemoryVcs::new();
        vcs.ensure_line("supervisor/r1").unwrap();
        let a = vcs.apply_and_commit("supervisor/r1", "p1", "first").unwrap();
        let b = vcs.apply_and_commit("supervisor/r1", "p2", "second").unwrap();
        assert_ne!(a, b);
        assert_eq!(vcs.commits("supervisor/r1").unwrap(), vec![a, b]);
        assert!(vcs.commits("supervisor/r2").unwrap().is_empty());
    }

    #[test]
    fn test_queued_failure_leaves_line_untouched() {
        let vcs = InMemoryVcs::new();
        vcs.fail_next(VcsError::Timeout {
            operation: "commit".into(),
        });
        assert!(vcs.apply_and_commit("l", "p", "m").is_err());
        assert!(vcs.line_commits("l").is_empty());
        assert!(vcs.apply_and_commit("l", "p", "m").is_ok());
    }
}

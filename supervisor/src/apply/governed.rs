//! The single entry point through which patches reach a repository.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use super::diff::{self, DiffProblem};
use super::policy::ProtectedPathPolicy;
use super::vcs::VersionControl;
use crate::error::{SupervisorError, SupervisorResult, VcsError};

/// Why a patch was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplyRejection {
    /// Patch touches paths the policy protects
    ProtectedPath { paths: Vec<String> },
    /// Patch could not be parsed or escapes the tree
    Malformed { message: String },
    /// Patch does not apply to the integration line
    Conflict { message: String },
    /// Backend failed; may succeed on retry
    Backend { message: String, retryable: bool },
}

impl ApplyRejection {
    /// Policy violations are never retried with the same patch.
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Self::ProtectedPath { .. })
    }

    /// Backend trouble rather than a bad patch.
    pub fn is_environment(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }

    pub fn message(&self) -> String {
        match self {
            Self::ProtectedPath { paths } => {
                format!("patch touches protected paths: {}", paths.join(", "))
            }
            Self::Malformed { message } => format!("malformed patch: {}", message),
            Self::Conflict { message } => format!("patch does not apply: {}", message),
            Self::Backend { message, .. } => format!("version control failure: {}", message),
        }
    }
}

impl From<VcsError> for ApplyRejection {
    fn from(err: VcsError) -> Self {
        match err {
            VcsError::PatchRejected { message } => Self::Conflict { message },
            other => Self::Backend {
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }
}

/// Result of `apply_patch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<ApplyRejection>,
    /// Files named by the patch, when it could be parsed
    #[serde(default)]
    pub files: Vec<String>,
}

impl ApplyOutcome {
    fn applied(commit_ref: String, files: Vec<String>) -> Self {
        Self {
            success: true,
            commit_ref: Some(commit_ref),
            rejection: None,
            files,
        }
    }

    fn rejected(rejection: ApplyRejection, files: Vec<String>) -> Self {
        Self {
            success: false,
            commit_ref: None,
            rejection: Some(rejection),
            files,
        }
    }
}

/// Applies patches under protected-path and atomicity constraints.
pub struct GovernedApplyPath {
    vcs: Arc<dyn VersionControl>,
    policy: Arc<dyn ProtectedPathPolicy>,
    lines: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GovernedApplyPath {
    pub fn new(vcs: Arc<dyn VersionControl>, policy: Arc<dyn ProtectedPathPolicy>) -> Self {
        Self {
            vcs,
            policy,
            lines: Mutex::new(HashMap::new()),
        }
    }

    /// Per-line mutex; created on first use.
    fn line_lock(&self, line: &str) -> SupervisorResult<Arc<Mutex<()>>> {
        let mut lines = self.lines.lock().map_err(|_| SupervisorError::LockPoisoned {
            what: "integration line registry",
        })?;
        Ok(lines
            .entry(line.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Create the integration line for a run.
    pub fn open_line(&self, line: &str) -> SupervisorResult<()> {
        let lock = self.line_lock(line)?;
        let _guard = lock.lock().map_err(|_| SupervisorError::LockPoisoned {
            what: "integration line",
        })?;
        self.vcs.ensure_line(line)?;
        Ok(())
    }

    /// Validate and apply one patch to `target_line`.
    ///
    /// Order: inspect, protected-path check, then a backend dry run and the
    /// commit under the line lock.
    ///
    /// Rejections are reported in the outcome, not as errors; only lock
    /// poisoning is an `Err`. A rejected patch never mutates the tree.
    pub fn apply_patch(
        &self,
        patch_content: &str,
        target_line: &str,
        commit_message: &str,
    ) -> SupervisorResult<ApplyOutcome> {
        let summary = match diff::inspect(patch_content) {
            Ok(summary) => summary,
            Err(problem) => {
                let rejection = ApplyRejection::Malformed {
                    message: problem.to_string(),
                };
                log_rejection(target_line, &rejection);
                let files = match problem {
                    DiffProblem::UnsafePath(p) => vec![p],
                    DiffProblem::NoTargets
                    | DiffProblem::NoHunks
                    | DiffProblem::Unresolvable(_) => Vec::new(),
                };
                return Ok(ApplyOutcome::rejected(rejection, files));
            }
        };

        let protected = self.policy.violations(&summary.files);
        if !protected.is_empty() {
            let rejection = ApplyRejection::ProtectedPath { paths: protected };
            log_rejection(target_line, &rejection);
            return Ok(ApplyOutcome::rejected(rejection, summary.files));
        }

        let lock = self.line_lock(target_line)?;
        let _guard = lock.lock().map_err(|_| SupervisorError::LockPoisoned {
            what: "integration line",
        })?;

        if let Err(err) = self.vcs.check_patch(target_line, patch_content) {
            let rejection = ApplyRejection::from(err);
            log_rejection(target_line, &rejection);
            return Ok(ApplyOutcome::rejected(rejection, summary.files));
        }

        match self
            .vcs
            .apply_and_commit(target_line, patch_content, commit_message)
        {
            Ok(commit_ref) => {
                info!(
                    line = target_line,
                    commit = %commit_ref,
                    files = summary.files.len(),
                    additions = summary.additions,
                    deletions = summary.deletions,
                    "Patch committed"
                );
                Ok(ApplyOutcome::applied(commit_ref, summary.files))
            }
            Err(err) => {
                let rejection = ApplyRejection::from(err);
                log_rejection(target_line, &rejection);
                Ok(ApplyOutcome::rejected(rejection, summary.files))
            }
        }
    }

    /// Commits on the line, oldest first.
    pub fn commits(&self, line: &str) -> SupervisorResult<Vec<String>> {
        Ok(self.vcs.commits(line)?)
    }
}

fn log_rejection(line: &str, rejection: &ApplyRejection) {
    warn!(line, reason = %rejection.message(), "Patch rejected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{InMemoryVcs, ProtectedPaths};

    const PATCH: &str = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-a\n+b\n";
    const PROTECTED_PATCH: &str =
        "--- a/.github/ci.yml\n+++ b/.github/ci.yml\n@@ -1 +1 @@\n-a\n+b\n";

    fn path_with(vcs: Arc<InMemoryVcs>) -> GovernedApplyPath {
        GovernedApplyPath::new(vcs, Arc::new(ProtectedPaths::new([".github"])))
    }

    #[test]
    fn test_apply_returns_commit() {
        let vcs = Arc::new(InMemoryVcs::new());
        let path = path_with(vcs.clone());
        let outcome = path.apply_patch(PATCH, "supervisor/r1", "msg").unwrap();
        assert!(outcome.success);
        assert!(outcome.commit_ref.is_some());
        assert_eq!(outcome.files, vec!["src/lib.rs"]);
        assert_eq!(vcs.line_commits("supervisor/r1").len(), 1);
    }

    #[test]
    fn test_protected_path_rejected_without_mutation() {
        let vcs = Arc::new(InMemoryVcs::new());
        let path = path_with(vcs.clone());
        let outcome = path
            .apply_patch(PROTECTED_PATCH, "supervisor/r1", "msg")
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.commit_ref.is_none());
        assert!(outcome.rejection.unwrap().is_policy_violation());
        assert!(vcs.line_commits("supervisor/r1").is_empty());
    }

    #[test]
    fn test_malformed_patch_rejected() {
        let vcs = Arc::new(InMemoryVcs::new());
        let outcome = path_with(vcs.clone())
            .apply_patch("not a diff", "supervisor/r1", "msg")
            .unwrap();
        assert!(matches!(
            outcome.rejection,
            Some(ApplyRejection::Malformed { .. })
        ));
        assert!(vcs.line_commits("supervisor/r1").is_empty());
    }

    #[test]
    fn test_prefix_trick_cannot_reach_protected_path() {
        let vcs = Arc::new(InMemoryVcs::new());
        let patch = "--- x/.github/ci.yml\n+++ y/.github/ci.yml\n@@ -1 +1 @@\n-a\n+b\n";
        let outcome = path_with(vcs.clone())
            .apply_patch(patch, "supervisor/r1", "msg")
            .unwrap();
        assert!(outcome.rejection.unwrap().is_policy_violation());
        assert_eq!(outcome.files, vec![".github/ci.yml"]);
        assert!(vcs.line_commits("supervisor/r1").is_empty());
    }

    #[test]
    fn test_unresolvable_header_is_malformed() {
        let vcs = Arc::new(InMemoryVcs::new());
        let patch = "--- ci.yml\n+++ ci.yml\n@@ -1 +1 @@\n-a\n+b\n";
        let outcome = path_with(vcs.clone())
            .apply_patch(patch, "supervisor/r1", "msg")
            .unwrap();
        assert!(matches!(
            outcome.rejection,
            Some(ApplyRejection::Malformed { .. })
        ));
        assert!(vcs.line_commits("supervisor/r1").is_empty());
    }

    #[test]
    fn test_backend_failure_maps_to_rejection() {
        let vcs = Arc::new(InMemoryVcs::new());
        vcs.fail_next(VcsError::Timeout {
            operation: "commit".into(),
        });
        let outcome = path_with(vcs.clone())
            .apply_patch(PATCH, "supervisor/r1", "msg")
            .unwrap();
        let rejection = outcome.rejection.unwrap();
        assert!(rejection.is_environment());
        assert!(matches!(rejection, ApplyRejection::Backend { retryable: true, .. }));
    }

    #[test]
    fn test_concurrent_applies_are_serialized() {
        let vcs = Arc::new(InMemoryVcs::new());
        let path = Arc::new(path_with(vcs.clone()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    path.apply_patch(PATCH, "supervisor/r1", &format!("c{}", i))
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap().success);
        }
        let commits = vcs.line_commits("supervisor/r1");
        assert_eq!(commits.len(), 8);
        let mut refs: Vec<_> = commits.iter().map(|c| c.commit_ref.clone()).collect();
        refs.dedup();
        assert_eq!(refs.len(), 8);
    }
}

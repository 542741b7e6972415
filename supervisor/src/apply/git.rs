//! Git backend for the governed apply path.
//!
//! Each integration line is a branch in one working tree. Every operation
//! checks the branch out under a tree-wide lock, so lines of different runs
//! never interleave inside the working directory. Every line starts from the
//! same pinned base commit, never from another run's line.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, warn};

use super::vcs::VersionControl;
use crate::config::{GitSettings, MAX_GIT_RETRIES};
use crate::error::VcsError;

/// Git CLI backend
pub struct GitVersionControl {
    working_dir: PathBuf,
    settings: GitSettings,
    tree: Mutex<()>,
    base: OnceLock<String>,
}

impl GitVersionControl {
    /// Pins the base commit right away when the repository already has one;
    /// otherwise it is resolved on the first line creation.
    pub fn new(working_dir: impl AsRef<Path>, settings: GitSettings) -> Self {
        let vcs = Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            settings,
            tree: Mutex::new(()),
            base: OnceLock::new(),
        };
        if let Err(e) = vcs.base_commit() {
            debug!(error = %e, "Base commit not resolvable yet");
        }
        vcs
    }

    /// Commit every integration line branches from.
    pub fn base_commit(&self) -> Result<&str, VcsError> {
        if let Some(base) = self.base.get() {
            return Ok(base.as_str());
        }
        let target = match &self.settings.base_ref {
            Some(base_ref) => format!("{}^{{commit}}", base_ref),
            None => "HEAD^{commit}".to_string(),
        };
        let resolved = self.run_git(&["rev-parse", "--verify", "--quiet", &target])?;
        Ok(self.base.get_or_init(|| resolved).as_str())
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-c")
            .arg(format!("user.name={}", self.settings.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.settings.author_email))
            .args(args)
            .current_dir(&self.working_dir);
        cmd
    }

    /// Run git command and return trimmed stdout
    fn run_git(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = self
            .command(args)
            .output()
            .map_err(|e| VcsError::command("execute", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::command(args.join(" "), stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git command feeding `input` on stdin
    fn run_git_stdin(&self, args: &[&str], input: &str) -> Result<String, VcsError> {
        let mut child = self
            .command(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VcsError::command("execute", e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| VcsError::command(args.join(" "), e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| VcsError::command(args.join(" "), e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::command(args.join(" "), stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git command with automatic retry for transient failures
    ///
    /// Uses exponential backoff: 100ms, 200ms, 400ms, etc.
    fn run_git_with_retry(&self, args: &[&str]) -> Result<String, VcsError> {
        let mut last_error = None;

        for attempt in 0..=self.settings.max_retries {
            match self.run_git(args) {
                Ok(output) => return Ok(output),
                Err(e) => {
                    if e.is_retryable() && attempt < self.settings.max_retries {
                        let delay = self
                            .settings
                            .retry_base_delay_ms
                            .saturating_mul(1u64 << attempt.min(MAX_GIT_RETRIES));
                        debug!(attempt, delay_ms = delay, error = %e, "Retrying git command");
                        std::thread::sleep(std::time::Duration::from_millis(delay));
                        last_error = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| VcsError::command("retry", "Max retries exceeded")))
    }

    fn branch_exists(&self, line: &str) -> bool {
        self.run_git(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", line)])
            .is_ok()
    }

    fn checkout(&self, line: &str) -> Result<(), VcsError> {
        if self.branch_exists(line) {
            self.run_git_with_retry(&["checkout", "--quiet", line])?;
        } else {
            let base = self.base_commit()?.to_string();
            self.run_git_with_retry(&["checkout", "--quiet", "-b", line, &base])?;
        }
        Ok(())
    }

    /// Throw away anything a failed apply left behind.
    fn restore_clean(&self) {
        if let Err(e) = self.run_git(&["reset", "--hard", "--quiet", "HEAD"]) {
            warn!(error = %e, "git reset after failed apply did not succeed");
        }
        if let Err(e) = self.run_git(&["clean", "-fd", "--quiet"]) {
            warn!(error = %e, "git clean after failed apply did not succeed");
        }
    }

    fn lock_tree(&self) -> Result<std::sync::MutexGuard<'_, ()>, VcsError> {
        self.tree
            .lock()
            .map_err(|_| VcsError::command("lock", "working tree lock poisoned"))
    }

    fn commit_message(&self, message: &str) -> String {
        if self.settings.commit_prefix.is_empty() {
            message.to_string()
        } else {
            format!("{} {}", self.settings.commit_prefix, message)
        }
    }
}

impl VersionControl for GitVersionControl {
    fn ensure_line(&self, line: &str) -> Result<(), VcsError> {
        let _tree = self.lock_tree()?;
        if !self.branch_exists(line) {
            let base = self.base_commit()?.to_string();
            self.run_git_with_retry(&["branch", line, &base])?;
            debug!(line, base = %base, "Created integration line");
        }
        Ok(())
    }

    fn check_patch(&self, line: &str, patch: &str) -> Result<(), VcsError> {
        let _tree = self.lock_tree()?;
        self.checkout(line)?;
        self.run_git_stdin(&["apply", "--check", "-"], patch)
            .map(|_| ())
            .map_err(|e| VcsError::PatchRejected {
                message: e.to_string(),
            })
    }

    fn apply_and_commit(&self, line: &str, patch: &str, message: &str) -> Result<String, VcsError> {
        let _tree = self.lock_tree()?;
        self.checkout(line)?;

        if let Err(e) = self.run_git_stdin(&["apply", "--check", "-"], patch) {
            return Err(VcsError::PatchRejected {
                message: e.to_string(),
            });
        }

        let applied = self
            .run_git_stdin(&["apply", "--index", "-"], patch)
            .and_then(|_| {
                self.run_git_with_retry(&["commit", "--quiet", "-m", &self.commit_message(message)])
            })
            .and_then(|_| self.run_git(&["rev-parse", "HEAD"]));

        match applied {
            Ok(commit_ref) => Ok(commit_ref),
            Err(e) => {
                self.restore_clean();
                Err(e)
            }
        }
    }

    fn commits(&self, line: &str) -> Result<Vec<String>, VcsError> {
        let _tree = self.lock_tree()?;
        let out = self.run_git(&["rev-list", "--reverse", line])?;
        Ok(out.lines().map(String::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().is_ok()
    }

    fn setup_git_repo() -> (tempfile::TempDir, GitVersionControl) {
        let dir = tempdir().unwrap();
        let git = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap()
        };

        git(&["init", "--quiet"]);
        git(&["config", "user.email", "test@test.com"]);
        git(&["config", "user.name", "Test"]);
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        git(&["add", "."]);
        git(&["commit", "--quiet", "-m", "Initial commit"]);

        let vcs = GitVersionControl::new(dir.path(), GitSettings::default());
        (dir, vcs)
    }

    const GOOD_PATCH: &str = "\
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1 +1,2 @@
 pub fn a() {}
+pub fn b() {}
";

    const BAD_PATCH: &str = "\
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1 +1 @@
-pub fn does_not_exist() {}
+pub fn b() {}
";

    #[test]
    fn test_apply_and_commit() {
        if !git_available() {
            return;
        }
        let (dir, vcs) = setup_git_repo();
        vcs.ensure_line("supervisor/r1").unwrap();
        let commit = vcs
            .apply_and_commit("supervisor/r1", GOOD_PATCH, "add b")
            .unwrap();
        assert!(commit.len() >= 7);

        let content = std::fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
        assert!(content.contains("pub fn b()"));
        assert_eq!(vcs.commits("supervisor/r1").unwrap().last(), Some(&commit));
    }

    #[test]
    fn test_rejected_patch_leaves_tree_unchanged() {
        if !git_available() {
            return;
        }
        let (dir, vcs) = setup_git_repo();
        vcs.ensure_line("supervisor/r1").unwrap();
        let before = vcs.commits("supervisor/r1").unwrap();

        let err = vcs
            .apply_and_commit("supervisor/r1", BAD_PATCH, "broken")
            .unwrap_err();
        assert!(matches!(err, VcsError::PatchRejected { .. }));

        let content = std::fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
        assert_eq!(content, "pub fn a() {}\n");
        assert_eq!(vcs.commits("supervisor/r1").unwrap(), before);
    }

    #[test]
    fn test_new_line_starts_from_base_not_previous_line() {
        if !git_available() {
            return;
        }
        let (_dir, vcs) = setup_git_repo();
        let base = vcs.base_commit().unwrap().to_string();

        vcs.ensure_line("supervisor/r1").unwrap();
        let r1_commit = vcs
            .apply_and_commit("supervisor/r1", GOOD_PATCH, "add b")
            .unwrap();

        // HEAD is now r1's line; r2 must still branch from the base.
        vcs.ensure_line("supervisor/r2").unwrap();
        assert_eq!(vcs.commits("supervisor/r2").unwrap(), vec![base.clone()]);
        assert!(!vcs.commits("supervisor/r2").unwrap().contains(&r1_commit));

        // Same for a line first created by checkout.
        vcs.apply_and_commit("supervisor/r3", GOOD_PATCH, "add b again")
            .unwrap();
        let r3 = vcs.commits("supervisor/r3").unwrap();
        assert_eq!(r3[0], base);
        assert_eq!(r3.len(), 2);
    }

    #[test]
    fn test_check_patch() {
        if !git_available() {
            return;
        }
        let (_dir, vcs) = setup_git_repo();
        vcs.ensure_line("supervisor/r2").unwrap();
        assert!(vcs.check_patch("supervisor/r2", GOOD_PATCH).is_ok());
        assert!(vcs.check_patch("supervisor/r2", BAD_PATCH).is_err());
    }
}

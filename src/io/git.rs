//! Git adapter for workspace change detection and patch generation.
//!
//! Every query here is best-effort: a workspace without git metadata, a
//! repository without HEAD, or a missing git binary must never fail a
//! session. Queries run under a short timeout so a wedged git cannot stall
//! finalization.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::io::process::run_command_with_timeout;

const GIT_TIMEOUT: Duration = Duration::from_secs(10);
const GIT_OUTPUT_LIMIT: usize = 10_000_000;
const GIT_KILL_GRACE: Duration = Duration::from_millis(500);

/// Sentinel written to `patch.diff` when the tree is clean.
pub const NO_CHANGES: &str = "(no changes)\n";
/// Sentinel written to `patch.diff` when git could not produce a diff.
pub const UNAVAILABLE: &str = "(unavailable)\n";

/// Change detection against a workspace's git state.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    workdir: PathBuf,
}

impl ChangeDetector {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Workspace-relative paths of files modified since HEAD plus untracked,
    /// non-ignored files. Both queries run concurrently; any failure on
    /// either side yields that side's empty list.
    pub fn changed_files(&self) -> Vec<String> {
        let (modified, untracked) = thread::scope(|scope| {
            let modified =
                scope.spawn(|| self.run_lines(&["diff", "--name-only", "HEAD"]));
            let untracked = scope.spawn(|| {
                self.run_lines(&["ls-files", "--others", "--exclude-standard"])
            });
            (
                modified.join().unwrap_or_default(),
                untracked.join().unwrap_or_default(),
            )
        });

        let mut files = modified;
        for path in untracked {
            if !files.contains(&path) {
                files.push(path);
            }
        }
        debug!(count = files.len(), "detected changed files");
        files
    }

    /// Full `git diff HEAD` text, or a sentinel when empty/unavailable.
    pub fn diff_head(&self) -> String {
        match self.run(&["diff", "HEAD"]) {
            Some(stdout) if stdout.trim().is_empty() => NO_CHANGES.to_string(),
            Some(stdout) => stdout,
            None => UNAVAILABLE.to_string(),
        }
    }

    fn run_lines(&self, args: &[&str]) -> Vec<String> {
        self.run(args)
            .map(|stdout| {
                stdout
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run git, returning stdout on success and `None` on any failure.
    fn run(&self, args: &[&str]) -> Option<String> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        let output =
            run_command_with_timeout(cmd, GIT_TIMEOUT, GIT_OUTPUT_LIMIT, GIT_KILL_GRACE).ok()?;
        if !output.success() {
            debug!(args = ?args, code = ?output.exit_code(), "git query failed");
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git(workdir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(workdir)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo(workdir: &Path) {
        git(workdir, &["init", "-q"]);
        git(workdir, &["config", "user.email", "t@example.com"]);
        git(workdir, &["config", "user.name", "t"]);
        fs::write(workdir.join("tracked.txt"), "one\n").expect("write");
        git(workdir, &["add", "-A"]);
        git(workdir, &["commit", "-q", "-m", "init"]);
    }

    #[test]
    fn non_repo_yields_empty_results() {
        let temp = tempfile::tempdir().expect("tempdir");
        let detector = ChangeDetector::new(temp.path());
        assert!(detector.changed_files().is_empty());
        assert_eq!(detector.diff_head(), UNAVAILABLE);
    }

    #[test]
    fn clean_repo_yields_no_changes_sentinel() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        let detector = ChangeDetector::new(temp.path());
        assert!(detector.changed_files().is_empty());
        assert_eq!(detector.diff_head(), NO_CHANGES);
    }

    #[test]
    fn modified_and_untracked_files_are_unioned() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        fs::write(temp.path().join("tracked.txt"), "two\n").expect("write");
        fs::write(temp.path().join("new.txt"), "fresh\n").expect("write");

        let detector = ChangeDetector::new(temp.path());
        let mut files = detector.changed_files();
        files.sort();
        assert_eq!(files, vec!["new.txt".to_string(), "tracked.txt".to_string()]);
    }

    #[test]
    fn ignored_files_are_excluded() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        fs::write(temp.path().join(".gitignore"), "*.log\n").expect("write");
        git(temp.path(), &["add", ".gitignore"]);
        git(temp.path(), &["commit", "-q", "-m", "ignore"]);
        fs::write(temp.path().join("noise.log"), "x\n").expect("write");

        let detector = ChangeDetector::new(temp.path());
        assert!(detector.changed_files().is_empty());
    }

    #[test]
    fn diff_head_carries_the_modification() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        fs::write(temp.path().join("tracked.txt"), "two\n").expect("write");

        let detector = ChangeDetector::new(temp.path());
        let diff = detector.diff_head();
        assert!(diff.contains("tracked.txt"));
        assert!(diff.contains("+two"));
    }
}

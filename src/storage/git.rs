//! Git Operations
//!
//! Safe wrapper around git CLI operations for each plan's working copy.
//! Every mutation of a repo goes through the repo operation queue, which
//! holds a lock and hands out a `GitRepo` scoped to the plan directory.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::utils::error::{AppError, AppResult};

/// Result of a git command execution
#[derive(Debug)]
pub struct GitResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl GitResult {
    /// Check if the command was successful and return stdout or error
    pub fn into_result(self) -> AppResult<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(AppError::git(format!(
                "Git command failed (exit {}): {}",
                self.exit_code,
                self.stderr.trim()
            )))
        }
    }
}

/// A plan's git-backed working copy.
#[derive(Debug, Clone)]
pub struct GitRepo {
    dir: PathBuf,
}

impl GitRepo {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Execute a git command in the repo directory
    pub fn execute(&self, args: &[&str]) -> AppResult<GitResult> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            // Disable interactive prompts to avoid hanging automation flows/tests.
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GCM_INTERACTIVE", "never")
            .output()
            .map_err(|e| AppError::git(format!("Failed to execute git: {}", e)))?;

        Ok(GitResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Initialize an empty repository with a `main` branch and an initial commit
    pub fn init(&self) -> AppResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        self.execute(&["init", "-b", "main"])?.into_result()?;
        self.execute(&["config", "user.email", "server@plandex.local"])?
            .into_result()?;
        self.execute(&["config", "user.name", "Plandex Server"])?
            .into_result()?;
        self.execute(&["commit", "--allow-empty", "-m", "init"])?
            .into_result()?;
        Ok(())
    }

    /// Get the current branch name
    pub fn current_branch(&self) -> AppResult<String> {
        self.execute(&["rev-parse", "--abbrev-ref", "HEAD"])?
            .into_result()
            .map(|s| s.trim().to_string())
    }

    /// Check if a branch exists locally
    pub fn branch_exists(&self, branch: &str) -> AppResult<bool> {
        let result = self.execute(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{}", branch),
        ])?;
        Ok(result.success)
    }

    /// Create a new branch from the current HEAD
    pub fn create_branch(&self, branch: &str) -> AppResult<()> {
        self.execute(&["branch", branch])?.into_result()?;
        Ok(())
    }

    /// Check out a branch, skipping the call when it is already current
    pub fn checkout(&self, branch: &str) -> AppResult<()> {
        if self.current_branch()? == branch {
            return Ok(());
        }
        self.execute(&["checkout", branch])?.into_result()?;
        Ok(())
    }

    /// Delete a local branch
    pub fn delete_branch(&self, branch: &str) -> AppResult<()> {
        self.execute(&["branch", "-D", branch])?.into_result()?;
        Ok(())
    }

    /// List local branch names
    pub fn branches(&self) -> AppResult<Vec<String>> {
        let out = self
            .execute(&["branch", "--format", "%(refname:short)"])?
            .into_result()?;
        Ok(out.lines().map(|l| l.trim().to_string()).collect())
    }

    /// Stage everything and commit. Returns false if there was nothing to commit.
    pub fn add_and_commit(&self, message: &str) -> AppResult<bool> {
        self.execute(&["add", "-A"])?.into_result()?;
        let status = self
            .execute(&["status", "--porcelain"])?
            .into_result()?;
        if status.trim().is_empty() {
            return Ok(false);
        }
        self.execute(&["commit", "-m", message])?.into_result()?;
        Ok(true)
    }

    /// Discard all uncommitted changes, staged and unstaged
    pub fn clear_uncommitted_changes(&self) -> AppResult<()> {
        self.execute(&["reset", "--hard"])?.into_result()?;
        self.execute(&["clean", "-fd"])?.into_result()?;
        Ok(())
    }

    /// Whether the working tree has uncommitted changes
    pub fn has_uncommitted_changes(&self) -> AppResult<bool> {
        let status = self.execute(&["status", "--porcelain"])?.into_result()?;
        Ok(!status.trim().is_empty())
    }

    /// Latest commit subject on the current branch
    pub fn latest_commit_message(&self) -> AppResult<String> {
        self.execute(&["log", "-1", "--pretty=%s"])?
            .into_result()
            .map(|s| s.trim().to_string())
    }

    /// Number of commits on the current branch
    pub fn commit_count(&self) -> AppResult<usize> {
        let out = self.execute(&["rev-list", "--count", "HEAD"])?.into_result()?;
        out.trim()
            .parse()
            .map_err(|e| AppError::git(format!("Bad rev-list output: {}", e)))
    }

    /// Remove a stale `.git/index.lock` left behind by a crashed worker.
    /// Tolerates the file not existing.
    pub fn remove_stale_index_lock(&self) -> AppResult<()> {
        let lock_file = self.dir.join(".git").join("index.lock");
        match std::fs::remove_file(&lock_file) {
            Ok(()) => {
                tracing::warn!(dir = %self.dir.display(), "removed stale git index.lock");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo() -> (tempfile::TempDir, GitRepo) {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepo::new(dir.path());
        repo.init().unwrap();
        (dir, repo)
    }

    #[test]
    fn test_init_creates_main_branch() {
        let (_dir, repo) = init_repo();
        assert_eq!(repo.current_branch().unwrap(), "main");
        assert!(repo.branch_exists("main").unwrap());
    }

    #[test]
    fn test_commit_and_count() {
        let (dir, repo) = init_repo();
        assert_eq!(repo.commit_count().unwrap(), 1);

        std::fs::write(dir.path().join("hello.txt"), "hi").unwrap();
        assert!(repo.add_and_commit("add hello").unwrap());
        assert_eq!(repo.commit_count().unwrap(), 2);
        assert_eq!(repo.latest_commit_message().unwrap(), "add hello");

        // nothing to commit second time around
        assert!(!repo.add_and_commit("noop").unwrap());
    }

    #[test]
    fn test_checkout_skips_when_current() {
        let (_dir, repo) = init_repo();
        repo.create_branch("dev").unwrap();
        repo.checkout("dev").unwrap();
        assert_eq!(repo.current_branch().unwrap(), "dev");
        // no-op checkout
        repo.checkout("dev").unwrap();
        repo.checkout("main").unwrap();
        assert_eq!(repo.current_branch().unwrap(), "main");
    }

    #[test]
    fn test_clear_uncommitted_changes() {
        let (dir, repo) = init_repo();
        std::fs::write(dir.path().join("junk.txt"), "junk").unwrap();
        assert!(repo.has_uncommitted_changes().unwrap());
        repo.clear_uncommitted_changes().unwrap();
        assert!(!repo.has_uncommitted_changes().unwrap());
        assert!(!dir.path().join("junk.txt").exists());
    }

    #[test]
    fn test_remove_stale_index_lock() {
        let (dir, repo) = init_repo();
        // tolerates absence
        repo.remove_stale_index_lock().unwrap();

        let lock_path = dir.path().join(".git").join("index.lock");
        std::fs::write(&lock_path, "").unwrap();
        repo.remove_stale_index_lock().unwrap();
        assert!(!lock_path.exists());
    }
}

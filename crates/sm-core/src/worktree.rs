use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::types::Task;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("worktree not found: {0}")]
    NotFound(String),
    #[error("initialization dependency {dep} of task {task} is not merged")]
    InitDepNotMerged { task: String, dep: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI invocations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    /// Run git with the given args in `dir`, returning its outcome.
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// WorkspaceInfo / BranchStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub path: String,
    pub branch: String,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchStatus {
    pub has_uncommitted: bool,
    pub ahead: u64,
    pub behind: u64,
    pub head_sha: String,
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// Creates and removes the isolated working copy for a task branch.
///
/// Each branch gets a directory at `{project_dir}/worktrees/{branch}/`;
/// the branch is created from the mainline head. Provisioning an already
/// existing worktree is a no-op, so a crashed run can safely replay it.
pub struct Provisioner {
    project_dir: PathBuf,
    mainline: String,
    git: Box<dyn GitRunner>,
}

impl Provisioner {
    pub fn new(project_dir: impl Into<PathBuf>, mainline: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            mainline: mainline.into(),
            git: Box::new(RealGitRunner),
        }
    }

    /// Create a provisioner with a custom git runner (for testing).
    pub fn with_git_runner(
        project_dir: impl Into<PathBuf>,
        mainline: impl Into<String>,
        git: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            project_dir: project_dir.into(),
            mainline: mainline.into(),
            git,
        }
    }

    pub fn mainline(&self) -> &str {
        &self.mainline
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Filesystem path of a branch's working copy.
    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        self.project_dir.join("worktrees").join(branch)
    }

    /// Create the working copy for `task.branch` from the mainline head.
    ///
    /// Tasks carrying `initialization_deps` may only be provisioned once
    /// every one of those tasks is merged into the mainline; the caller
    /// passes the ids still unmerged so this can fail loudly.
    pub fn provision(&self, task: &Task, unmerged_init_deps: &[String]) -> Result<WorkspaceInfo> {
        if let Some(dep) = unmerged_init_deps.first() {
            return Err(WorktreeError::InitDepNotMerged {
                task: task.id.clone(),
                dep: dep.clone(),
            });
        }

        let wt_path = self.worktree_path(&task.branch);
        if wt_path.exists() {
            info!(branch = %task.branch, path = %wt_path.display(), "worktree already provisioned");
            return Ok(WorkspaceInfo {
                path: wt_path.display().to_string(),
                branch: task.branch.clone(),
                base_branch: self.mainline.clone(),
                created_at: Utc::now(),
            });
        }

        let parent = wt_path.parent().expect("worktrees parent");
        std::fs::create_dir_all(parent)?;

        let project = self.project_str();
        let wt_str = wt_path.to_str().unwrap_or(".");

        info!(
            task_id = %task.id,
            branch = %task.branch,
            path = %wt_path.display(),
            "provisioning worktree"
        );

        let out = self
            .git
            .run_git(
                project,
                &["worktree", "add", "-b", &task.branch, wt_str, &self.mainline],
            )
            .map_err(WorktreeError::GitCommand)?;

        if !out.success {
            // The branch may survive a previous crash; attach to it instead.
            if out.stderr.contains("already exists") {
                let retry = self
                    .git
                    .run_git(project, &["worktree", "add", wt_str, &task.branch])
                    .map_err(WorktreeError::GitCommand)?;
                if !retry.success {
                    return Err(WorktreeError::GitCommand(retry.stderr));
                }
            } else {
                return Err(WorktreeError::GitCommand(out.stderr));
            }
        }

        Ok(WorkspaceInfo {
            path: wt_path.display().to_string(),
            branch: task.branch.clone(),
            base_branch: self.mainline.clone(),
            created_at: Utc::now(),
        })
    }

    /// Remove the working copy; additionally delete the branch when it has
    /// been merged or explicitly reset.
    pub fn tear_down(&self, branch: &str, delete_branch: bool) -> Result<()> {
        let wt_path = self.worktree_path(branch);
        let project = self.project_str();

        if wt_path.exists() {
            let out = self
                .git
                .run_git(
                    project,
                    &["worktree", "remove", "--force", wt_path.to_str().unwrap_or(".")],
                )
                .map_err(WorktreeError::GitCommand)?;
            if !out.success {
                warn!(branch, stderr = %out.stderr, "worktree remove failed");
                return Err(WorktreeError::GitCommand(out.stderr));
            }
        }

        if delete_branch {
            let out = self
                .git
                .run_git(project, &["branch", "-D", branch])
                .map_err(WorktreeError::GitCommand)?;
            if !out.success && !out.stderr.contains("not found") {
                warn!(branch, stderr = %out.stderr, "branch delete failed");
            }
        }

        Ok(())
    }

    /// Current status of a task branch relative to the mainline.
    pub fn status(&self, branch: &str) -> Result<BranchStatus> {
        let project = self.project_str();

        let head = self
            .git
            .run_git(project, &["rev-parse", branch])
            .map_err(WorktreeError::GitCommand)?;
        if !head.success {
            return Err(WorktreeError::NotFound(branch.to_string()));
        }
        let head_sha = head.stdout.trim().to_string();

        let counts = self
            .git
            .run_git(
                project,
                &[
                    "rev-list",
                    "--left-right",
                    "--count",
                    &format!("{}...{}", self.mainline, branch),
                ],
            )
            .map_err(WorktreeError::GitCommand)?;
        let (behind, ahead) = parse_left_right(&counts.stdout);

        let wt_path = self.worktree_path(branch);
        let has_uncommitted = if wt_path.exists() {
            let st = self
                .git
                .run_git(
                    wt_path.to_str().unwrap_or("."),
                    &["status", "--porcelain"],
                )
                .map_err(WorktreeError::GitCommand)?;
            !st.stdout.trim().is_empty()
        } else {
            false
        };

        Ok(BranchStatus {
            has_uncommitted,
            ahead,
            behind,
            head_sha,
        })
    }

    /// True when the branch head is already reachable from the mainline,
    /// re-merging it would be a no-op (idempotent replay after a crash).
    pub fn is_merged(&self, branch: &str) -> Result<bool> {
        let out = self
            .git
            .run_git(
                self.project_str(),
                &["merge-base", "--is-ancestor", branch, &self.mainline],
            )
            .map_err(WorktreeError::GitCommand)?;
        Ok(out.success)
    }

    /// Run an arbitrary git command against the project checkout. Used by
    /// the merge queue, which shares this provisioner's runner.
    pub fn run(&self, args: &[&str]) -> std::result::Result<GitOutput, String> {
        self.git.run_git(self.project_str(), args)
    }

    fn project_str(&self) -> &str {
        self.project_dir.to_str().unwrap_or(".")
    }
}

/// Parse `git rev-list --left-right --count a...b` output (`"<left>\t<right>"`).
fn parse_left_right(stdout: &str) -> (u64, u64) {
    let mut it = stdout.split_whitespace();
    let left = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let right = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (left, right)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Ordered integration of completed branches into the mainline.
//!
//! The queue holds COMPLETED tasks in `(merge_order, completed_at)` order
//! and merges at most one branch per `advance` call, so two merges are
//! never in flight for the same project. A blocked entry does not
//! head-of-line block the queue: later mergeable entries overtake it
//! (anything depending on the blocked entry is itself unmergeable, so
//! declared ordering within a dependency chain is preserved).

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use sm_core::config::MergeStrategy;
use sm_core::types::{Task, TaskStatus};
use sm_core::worktree::{GitOutput, Provisioner};

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task_id: String,
    pub merge_order: i64,
    pub completed_at: DateTime<Utc>,
    /// Set by the `hold` conflict policy; held entries wait for an
    /// operator and are skipped by the queue.
    pub held: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergePlanEntry {
    pub task_id: String,
    pub branch: String,
    pub mergeable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

#[derive(Debug, Default)]
pub struct MergeQueue {
    entries: Vec<QueueEntry>,
    /// Reason the queue is paused (`abort` policy); cleared by an
    /// operator acknowledgement.
    paused: Option<String>,
}

impl MergeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the queue in line with the store: enqueue COMPLETED tasks we
    /// have not seen, drop entries whose task moved on (merged, reset,
    /// deleted), and restore the declared order.
    pub fn sync(&mut self, tasks: &[Task]) {
        self.entries.retain(|e| {
            tasks
                .iter()
                .any(|t| t.id == e.task_id && t.status == TaskStatus::Completed)
        });
        for task in tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
            if !self.entries.iter().any(|e| e.task_id == task.id) {
                self.entries.push(QueueEntry {
                    task_id: task.id.clone(),
                    merge_order: task.merge_order,
                    completed_at: task.completed_at.unwrap_or_else(Utc::now),
                    held: false,
                });
            }
        }
        self.entries
            .sort_by(|a, b| a.merge_order.cmp(&b.merge_order).then(a.completed_at.cmp(&b.completed_at)));
    }

    /// Manual enqueue (the `/merge` endpoint); also clears a hold.
    pub fn enqueue(&mut self, task: &Task) {
        match self.entries.iter_mut().find(|e| e.task_id == task.id) {
            Some(entry) => entry.held = false,
            None => {
                self.entries.push(QueueEntry {
                    task_id: task.id.clone(),
                    merge_order: task.merge_order,
                    completed_at: task.completed_at.unwrap_or_else(Utc::now),
                    held: false,
                });
                self.entries.sort_by(|a, b| {
                    a.merge_order
                        .cmp(&b.merge_order)
                        .then(a.completed_at.cmp(&b.completed_at))
                });
            }
        }
    }

    pub fn drop_task(&mut self, task_id: &str) {
        self.entries.retain(|e| e.task_id != task_id);
    }

    pub fn hold_task(&mut self, task_id: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.task_id == task_id) {
            entry.held = true;
        }
    }

    pub fn pause(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "merge queue paused until acknowledged");
        self.paused = Some(reason);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    pub fn acknowledge(&mut self) {
        if self.paused.take().is_some() {
            info!("merge queue pause acknowledged");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry that can merge right now: every dependency MERGED and
    /// none of the task's touched files locked by a live agent.
    pub fn next_mergeable<'a>(
        &self,
        tasks: &'a [Task],
        locked_paths: impl Fn(&Task) -> Vec<String>,
    ) -> Option<&'a Task> {
        if self.paused.is_some() {
            return None;
        }
        for entry in self.entries.iter().filter(|e| !e.held) {
            let Some(task) = tasks.iter().find(|t| t.id == entry.task_id) else {
                continue;
            };
            if !deps_merged(task, tasks) {
                continue;
            }
            if !locked_paths(task).is_empty() {
                continue;
            }
            return Some(task);
        }
        None
    }

    /// The planned sequence, without executing anything.
    pub fn preview(
        &self,
        tasks: &[Task],
        locked_paths: impl Fn(&Task) -> Vec<String>,
    ) -> Vec<MergePlanEntry> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let task = tasks.iter().find(|t| t.id == entry.task_id)?;
                let blocked_by = if entry.held {
                    Some("held for manual intervention".to_string())
                } else if !deps_merged(task, tasks) {
                    Some("dependencies not merged".to_string())
                } else {
                    let locked = locked_paths(task);
                    if locked.is_empty() {
                        None
                    } else {
                        Some(format!("files locked: {}", locked.join(", ")))
                    }
                };
                Some(MergePlanEntry {
                    task_id: task.id.clone(),
                    branch: task.branch.clone(),
                    mergeable: blocked_by.is_none(),
                    blocked_by,
                })
            })
            .collect()
    }
}

fn deps_merged(task: &Task, tasks: &[Task]) -> bool {
    task.dependencies.iter().all(|d| {
        tasks
            .iter()
            .find(|t| &t.id == d)
            .map(|t| t.status == TaskStatus::Merged)
            .unwrap_or(true) // deleted dependency no longer gates
    })
}

// ---------------------------------------------------------------------------
// Merge execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The branch head is already reachable from the mainline; replaying
    /// after a crash lands here.
    AlreadyMerged,
    /// No commits to integrate.
    NothingToMerge,
    Conflict(Vec<String>),
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("git command failed: {0}")]
    GitCommand(String),
}

/// Integrate `task.branch` into the mainline with the configured strategy.
///
/// Runs entirely through the provisioner's git runner against the main
/// checkout. On conflict the merge (or rebase) is aborted and the
/// conflicting paths are reported; the caller applies the conflict policy.
pub fn execute_merge(
    provisioner: &Provisioner,
    task: &Task,
    strategy: MergeStrategy,
    ff_only: bool,
) -> Result<MergeOutcome, MergeError> {
    let branch = task.branch.as_str();
    let mainline = provisioner.mainline().to_string();

    if provisioner.is_merged(branch).map_err(|e| MergeError::GitCommand(e.to_string()))? {
        info!(branch, "branch already merged, replay is a no-op");
        return Ok(MergeOutcome::AlreadyMerged);
    }

    let run = |args: &[&str]| -> Result<GitOutput, MergeError> {
        provisioner.run(args).map_err(MergeError::GitCommand)
    };

    let diff = run(&["diff", "--stat", &mainline, branch])?;
    if diff.success && diff.stdout.trim().is_empty() {
        info!(branch, "nothing to merge");
        return Ok(MergeOutcome::NothingToMerge);
    }

    let checkout = run(&["checkout", &mainline])?;
    if !checkout.success {
        return Err(MergeError::GitCommand(checkout.stderr));
    }

    if ff_only {
        let out = run(&["merge", "--ff-only", branch])?;
        return if out.success {
            Ok(MergeOutcome::Merged)
        } else {
            Ok(MergeOutcome::Conflict(vec![format!(
                "not fast-forwardable: {}",
                out.stderr.trim()
            )]))
        };
    }

    match strategy {
        MergeStrategy::Merge => {
            let out = run(&["merge", "--no-ff", "--no-commit", branch])?;
            if !out.success {
                let conflicts = conflict_files(provisioner);
                let _ = run(&["merge", "--abort"]);
                warn!(branch, ?conflicts, "merge conflicts detected");
                return Ok(MergeOutcome::Conflict(conflicts));
            }
            let msg = format!("Merge branch '{branch}' into {mainline}");
            let commit = run(&["commit", "-m", &msg])?;
            if !commit.success {
                return Err(MergeError::GitCommand(commit.stderr));
            }
            Ok(MergeOutcome::Merged)
        }
        MergeStrategy::Squash => {
            let out = run(&["merge", "--squash", branch])?;
            if !out.success {
                let conflicts = conflict_files(provisioner);
                let _ = run(&["merge", "--abort"]);
                warn!(branch, ?conflicts, "squash merge conflicts detected");
                return Ok(MergeOutcome::Conflict(conflicts));
            }
            let msg = format!("{} (squash of {branch})", task.title);
            let commit = run(&["commit", "-m", &msg])?;
            if !commit.success {
                return Err(MergeError::GitCommand(commit.stderr));
            }
            Ok(MergeOutcome::Merged)
        }
        MergeStrategy::Rebase => {
            let rebase = run(&["rebase", &mainline, branch])?;
            if !rebase.success {
                let conflicts = conflict_files(provisioner);
                let _ = run(&["rebase", "--abort"]);
                warn!(branch, ?conflicts, "rebase conflicts detected");
                // Rebase leaves HEAD on the branch side; restore mainline.
                let _ = run(&["checkout", &mainline]);
                return Ok(MergeOutcome::Conflict(conflicts));
            }
            let back = run(&["checkout", &mainline])?;
            if !back.success {
                return Err(MergeError::GitCommand(back.stderr));
            }
            let ff = run(&["merge", "--ff-only", branch])?;
            if !ff.success {
                return Err(MergeError::GitCommand(ff.stderr));
            }
            Ok(MergeOutcome::Merged)
        }
    }
}

fn conflict_files(provisioner: &Provisioner) -> Vec<String> {
    provisioner
        .run(&["diff", "--name-only", "--diff-filter=U"])
        .map(|out| {
            out.stdout
                .lines()
                .filter(|l| !l.is_empty())
                .map(|l| l.to_string())
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

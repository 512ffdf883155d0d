//! File-backed task persistence with single-writer semantics.
//!
//! One `tasks.md` per project. All in-process mutation goes through a
//! per-project mutex; external editors are advisory. A write detects
//! that the file changed on disk since it was loaded and refuses to
//! clobber it unless forced.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::taskfile::{self, TaskfileError};
use crate::types::{validate_branch_name, Task, TaskStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Taskfile(#[from] TaskfileError),
    #[error("task {task}: invalid {field}: {reason}")]
    InvalidField {
        task: String,
        field: String,
        reason: String,
    },
    #[error("branch {branch} is declared by both {first} and {second}")]
    DuplicateBranch {
        branch: String,
        first: String,
        second: String,
    },
    #[error("task {task}: dependency {dependency} does not resolve to any task")]
    UnknownDependency { task: String, dependency: String },
    #[error("dependency cycle involving task {task}")]
    DependencyCycle { task: String },
    #[error("{path} changed on disk since it was loaded; reload or force the write")]
    StaleWrite { path: String },
    #[error("task not found: {0}")]
    UnknownTask(String),
    #[error("task {task}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

struct Inner {
    tasks: Vec<Task>,
    /// Mtime of the file at the moment we last read or wrote it.
    disk_mtime: Option<SystemTime>,
}

/// Serialized access to one project's task list.
pub struct TaskStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl TaskStore {
    /// Open the store, loading the task file when it exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tasks, disk_mtime) = if path.exists() {
            let text = tokio::fs::read_to_string(&path).await?;
            let mut tasks = taskfile::parse_tasks(&text)?;
            resolve_dependencies(&mut tasks)?;
            validate_tasks(&tasks)?;
            (tasks, file_mtime(&path))
        } else {
            (Vec::new(), None)
        };
        info!(path = %path.display(), tasks = tasks.len(), "task store opened");
        Ok(Self {
            path,
            inner: Mutex::new(Inner { tasks, disk_mtime }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, discarding in-memory state (last-writer-wins for
    /// external edits).
    pub async fn reload(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.path.exists() {
            let text = tokio::fs::read_to_string(&self.path).await?;
            let mut tasks = taskfile::parse_tasks(&text)?;
            resolve_dependencies(&mut tasks)?;
            validate_tasks(&tasks)?;
            inner.tasks = tasks;
        } else {
            inner.tasks.clear();
        }
        inner.disk_mtime = file_mtime(&self.path);
        Ok(())
    }

    /// Snapshot of every task, in file order.
    pub async fn list(&self) -> Vec<Task> {
        self.inner.lock().await.tasks.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner
            .lock()
            .await
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    /// Append a new task and persist.
    pub async fn insert(&self, task: Task) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.tasks.push(task);
        if let Err(e) = revalidate(&mut inner.tasks) {
            inner.tasks.pop();
            return Err(e);
        }
        self.persist(&mut inner, false).await
    }

    /// Remove a task by id and persist. The caller decides whether an
    /// in-progress task may be removed.
    pub async fn remove(&self, id: &str) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let idx = inner
            .tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| StoreError::UnknownTask(id.to_string()))?;
        let removed = inner.tasks.remove(idx);
        // Dependencies on the removed task are dropped rather than left
        // dangling; dependents fall back to being independently schedulable.
        for t in inner.tasks.iter_mut() {
            t.dependencies.retain(|d| d != id);
            t.initialization_deps.retain(|d| d != id);
        }
        self.persist(&mut inner, false).await?;
        Ok(removed)
    }

    /// Mutate a single task through a closure, then validate and persist.
    pub async fn update<F>(&self, id: &str, patch: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let mut inner = self.inner.lock().await;
        let before = inner.tasks.clone();
        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::UnknownTask(id.to_string()))?;
        patch(task);
        task.updated_at = chrono::Utc::now();
        let updated = task.clone();
        if let Err(e) = revalidate(&mut inner.tasks) {
            inner.tasks = before;
            return Err(e);
        }
        self.persist(&mut inner, false).await?;
        Ok(updated)
    }

    /// Mutate the whole list in one transaction (scheduler / merge queue
    /// batches), then validate and persist.
    pub async fn apply<F, R>(&self, mutate: F) -> Result<R>
    where
        F: FnOnce(&mut Vec<Task>) -> R,
    {
        let mut inner = self.inner.lock().await;
        let before = inner.tasks.clone();
        let out = mutate(&mut inner.tasks);
        if let Err(e) = revalidate(&mut inner.tasks) {
            inner.tasks = before;
            return Err(e);
        }
        self.persist(&mut inner, false).await?;
        Ok(out)
    }

    /// Transition a task's status, enforcing the state machine, and persist
    /// before the caller performs any corresponding external side effect.
    pub async fn transition(&self, id: &str, to: TaskStatus) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let before = inner.tasks.clone();
        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::UnknownTask(id.to_string()))?;
        if !task.status.can_transition_to(&to) {
            return Err(StoreError::InvalidTransition {
                task: id.to_string(),
                from: task.status,
                to,
            });
        }
        task.set_status(to);
        if to != TaskStatus::InProgress {
            task.session = None;
        }
        let updated = task.clone();
        if let Err(e) = revalidate(&mut inner.tasks) {
            inner.tasks = before;
            return Err(e);
        }
        self.persist(&mut inner, false).await?;
        Ok(updated)
    }

    /// UP_NEXT -> IN_PROGRESS, assigning the session in the same durable
    /// write. The session name is deterministic, so this persists before
    /// the spawn side effect while keeping the session/status invariant.
    pub async fn claim(&self, id: &str, session: &str) -> Result<Task> {
        let mut inner = self.inner.lock().await;
        let before = inner.tasks.clone();
        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::UnknownTask(id.to_string()))?;
        if !task.status.can_transition_to(&TaskStatus::InProgress) {
            return Err(StoreError::InvalidTransition {
                task: id.to_string(),
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }
        task.set_status(TaskStatus::InProgress);
        task.session = Some(session.to_string());
        let updated = task.clone();
        if let Err(e) = revalidate(&mut inner.tasks) {
            inner.tasks = before;
            return Err(e);
        }
        self.persist(&mut inner, false).await?;
        Ok(updated)
    }

    /// Force-write the current in-memory state, ignoring staleness.
    pub async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.persist(&mut inner, true).await
    }

    async fn persist(&self, inner: &mut Inner, force: bool) -> Result<()> {
        if !force {
            let on_disk = file_mtime(&self.path);
            if inner.disk_mtime.is_some() && on_disk != inner.disk_mtime {
                return Err(StoreError::StaleWrite {
                    path: self.path.display().to_string(),
                });
            }
        }

        let text = taskfile::serialize_tasks(&inner.tasks);
        write_atomic(&self.path, &text)?;
        inner.disk_mtime = file_mtime(&self.path);
        debug!(path = %self.path.display(), tasks = inner.tasks.len(), "task store written");
        Ok(())
    }
}

/// Write via a sibling temp file, fsync, then rename into place.
fn write_atomic(path: &Path, text: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "tasks.md".to_string())
    ));
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(text.as_bytes())?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn revalidate(tasks: &mut Vec<Task>) -> Result<()> {
    resolve_dependencies(tasks)?;
    validate_tasks(tasks)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Rewrite dependency references given by branch name into task ids.
pub fn resolve_dependencies(tasks: &mut [Task]) -> Result<()> {
    let ids: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let by_branch: HashMap<String, String> = tasks
        .iter()
        .map(|t| (t.branch.clone(), t.id.clone()))
        .collect();

    for i in 0..tasks.len() {
        let task_id = tasks[i].id.clone();
        for dep_list in [true, false] {
            let deps = if dep_list {
                &mut tasks[i].dependencies
            } else {
                &mut tasks[i].initialization_deps
            };
            for dep in deps.iter_mut() {
                if ids.contains(dep.as_str()) {
                    continue;
                }
                if let Some(id) = by_branch.get(dep.as_str()) {
                    *dep = id.clone();
                    continue;
                }
                return Err(StoreError::UnknownDependency {
                    task: task_id,
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Enforce the save-time invariants: branch syntax and uniqueness, acyclic
/// dependencies, and session/status consistency.
pub fn validate_tasks(tasks: &[Task]) -> Result<()> {
    let mut branches: HashMap<&str, &str> = HashMap::new();
    for task in tasks {
        validate_branch_name(&task.branch).map_err(|reason| StoreError::InvalidField {
            task: task.id.clone(),
            field: "branch".to_string(),
            reason,
        })?;
        if let Some(first) = branches.insert(&task.branch, &task.id) {
            return Err(StoreError::DuplicateBranch {
                branch: task.branch.clone(),
                first: first.to_string(),
                second: task.id.clone(),
            });
        }
        if task.session.is_some() != (task.status == TaskStatus::InProgress) {
            return Err(StoreError::InvalidField {
                task: task.id.clone(),
                field: "session".to_string(),
                reason: format!(
                    "session must be set iff status is IN_PROGRESS (status {}, session {:?})",
                    task.status, task.session
                ),
            });
        }
    }
    detect_cycles(tasks)
}

fn detect_cycles(tasks: &[Task]) -> Result<()> {
    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    // 0 = unvisited, 1 = on stack, 2 = done
    let mut color = vec![0u8; tasks.len()];

    fn visit(
        i: usize,
        tasks: &[Task],
        index: &HashMap<&str, usize>,
        color: &mut [u8],
    ) -> Result<()> {
        color[i] = 1;
        for dep in &tasks[i].dependencies {
            let Some(&j) = index.get(dep.as_str()) else {
                continue;
            };
            match color[j] {
                1 => {
                    return Err(StoreError::DependencyCycle {
                        task: tasks[j].id.clone(),
                    })
                }
                0 => visit(j, tasks, index, color)?,
                _ => {}
            }
        }
        color[i] = 2;
        Ok(())
    }

    for i in 0..tasks.len() {
        if color[i] == 0 {
            visit(i, tasks, &index, &mut color)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, branch: &str) -> Task {
        let mut t = Task::new(id, branch);
        t.id = id.to_string();
        t
    }

    #[test]
    fn duplicate_branch_is_rejected() {
        let tasks = vec![task("a", "same"), task("b", "same")];
        match validate_tasks(&tasks) {
            Err(StoreError::DuplicateBranch { branch, .. }) => assert_eq!(branch, "same"),
            other => panic!("expected DuplicateBranch, got {other:?}"),
        }
    }

    #[test]
    fn session_without_in_progress_is_rejected() {
        let mut t = task("a", "a");
        t.session = Some("a-a".to_string());
        match validate_tasks(&[t]) {
            Err(StoreError::InvalidField { field, .. }) => assert_eq!(field, "session"),
            other => panic!("expected InvalidField, got {other:?}"),
        }
    }

    #[test]
    fn in_progress_without_session_is_rejected() {
        let mut t = task("a", "a");
        t.status = TaskStatus::InProgress;
        assert!(validate_tasks(&[t]).is_err());
    }

    #[test]
    fn in_progress_with_session_is_accepted() {
        let mut t = task("a", "a");
        t.status = TaskStatus::InProgress;
        t.session = Some("a-a".to_string());
        assert!(validate_tasks(&[t]).is_ok());
    }

    #[test]
    fn branch_references_resolve_to_ids() {
        let mut a = task("a", "branch-a");
        let b = task("b", "branch-b");
        a.dependencies = vec!["branch-b".to_string()];
        let mut tasks = vec![a, b];
        resolve_dependencies(&mut tasks).unwrap();
        assert_eq!(tasks[0].dependencies, vec!["b"]);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut a = task("a", "branch-a");
        a.dependencies = vec!["ghost".to_string()];
        let mut tasks = vec![a];
        match resolve_dependencies(&mut tasks) {
            Err(StoreError::UnknownDependency { dependency, .. }) => {
                assert_eq!(dependency, "ghost")
            }
            other => panic!("expected UnknownDependency, got {other:?}"),
        }
    }

    #[test]
    fn cycles_are_rejected() {
        let mut a = task("a", "branch-a");
        let mut b = task("b", "branch-b");
        a.dependencies = vec!["b".to_string()];
        b.dependencies = vec!["a".to_string()];
        match validate_tasks(&[a, b]) {
            Err(StoreError::DependencyCycle { .. }) => {}
            other => panic!("expected DependencyCycle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_insert_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.md");
        let store = TaskStore::open(&path).await.unwrap();
        store.insert(task("a", "branch-a")).await.unwrap();

        let reopened = TaskStore::open(&path).await.unwrap();
        let got = reopened.get("a").await.unwrap();
        assert_eq!(got.branch, "branch-a");
    }

    #[tokio::test]
    async fn transition_enforces_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.md")).await.unwrap();
        store.insert(task("a", "branch-a")).await.unwrap();

        match store.transition("a", TaskStatus::Merged).await {
            Err(StoreError::InvalidTransition { from, to, .. }) => {
                assert_eq!(from, TaskStatus::Unclaimed);
                assert_eq!(to, TaskStatus::Merged);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }

        store.transition("a", TaskStatus::UpNext).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().status, TaskStatus::UpNext);
    }

    #[tokio::test]
    async fn stale_write_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.md");
        let store = TaskStore::open(&path).await.unwrap();
        store.insert(task("a", "branch-a")).await.unwrap();

        // External edit: rewrite the file with a newer mtime.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text).unwrap();
        filetime_touch(&path);

        match store.update("a", |t| t.priority = 9).await {
            Err(StoreError::StaleWrite { .. }) => {}
            other => panic!("expected StaleWrite, got {other:?}"),
        }

        // Reload adopts the external content; writes work again.
        store.reload().await.unwrap();
        store.update("a", |t| t.priority = 9).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().priority, 9);
    }

    fn filetime_touch(path: &Path) {
        // Rewriting the file is not guaranteed to bump mtime within the
        // same clock tick; force a distinct timestamp.
        let file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        let _ = file.set_modified(SystemTime::now() + std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn remove_drops_dangling_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.md")).await.unwrap();
        store.insert(task("a", "branch-a")).await.unwrap();
        let mut b = task("b", "branch-b");
        b.dependencies = vec!["a".to_string()];
        store.insert(b).await.unwrap();

        store.remove("a").await.unwrap();
        let b = store.get("b").await.unwrap();
        assert!(b.dependencies.is_empty());
    }

    #[tokio::test]
    async fn failed_update_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.md")).await.unwrap();
        store.insert(task("a", "branch-a")).await.unwrap();
        store.insert(task("b", "branch-b")).await.unwrap();

        // Patch introduces a duplicate branch; the store must keep the
        // previous state.
        assert!(store
            .update("b", |t| t.branch = "branch-a".to_string())
            .await
            .is_err());
        assert_eq!(store.get("b").await.unwrap().branch, "branch-b");
    }
}

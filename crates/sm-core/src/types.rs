use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Unclaimed,
    UpNext,
    InProgress,
    Completed,
    Merged,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Any state may be reset back to `Unclaimed` (user reset, spawn
    /// failure, heartbeat timeout, merge-conflict reset policy).
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Unclaimed, TaskStatus::UpNext)
                | (TaskStatus::UpNext, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::Completed, TaskStatus::Merged)
                | (_, TaskStatus::Unclaimed)
        ) && !matches!((self, target), (TaskStatus::Unclaimed, TaskStatus::Unclaimed))
    }

    /// Statuses that satisfy a scheduling dependency (`d` done enough for
    /// a dependent to start).
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Merged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Unclaimed => "UNCLAIMED",
            TaskStatus::UpNext => "UP_NEXT",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Merged => "MERGED",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "UNCLAIMED" => Some(TaskStatus::Unclaimed),
            "UP_NEXT" => Some(TaskStatus::UpNext),
            "IN_PROGRESS" => Some(TaskStatus::InProgress),
            "COMPLETED" => Some(TaskStatus::Completed),
            "MERGED" => Some(TaskStatus::Merged),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Custom agent instruction; `None` means the default template is
    /// composed from title + description at spawn time.
    pub prompt: Option<String>,
    pub branch: String,
    /// Name of the live terminal session. Non-null iff `status == InProgress`.
    pub session: Option<String>,
    pub status: TaskStatus,
    /// Task ids (resolved from id or branch references at load time) that
    /// must reach at least `Completed` before this task may start.
    pub dependencies: Vec<String>,
    /// Task ids that must be `Merged` before the worktree is provisioned.
    pub initialization_deps: Vec<String>,
    pub priority: i64,
    pub merge_order: i64,
    pub exclusive_files: Vec<String>,
    pub shared_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    /// Failed spawn attempts so far; past the retry budget the task is
    /// marked `blocked` and needs a manual reset.
    pub spawn_attempts: u32,
    pub blocked: bool,
    /// Keys we do not understand, preserved verbatim for round-trips.
    pub unknown_fields: Vec<(String, String)>,
}

impl Task {
    pub fn new(title: impl Into<String>, branch: impl Into<String>) -> Self {
        let title = title.into();
        let now = Utc::now();
        Self {
            id: task_id_from_title(&title),
            title,
            description: String::new(),
            prompt: None,
            branch: branch.into(),
            session: None,
            status: TaskStatus::Unclaimed,
            dependencies: Vec::new(),
            initialization_deps: Vec::new(),
            priority: 0,
            merge_order: 0,
            exclusive_files: Vec::new(),
            shared_files: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            merged_at: None,
            spawn_attempts: 0,
            blocked: false,
            unknown_fields: Vec::new(),
        }
    }

    /// All files this task declared it touches (exclusive ∪ shared).
    pub fn touched_files(&self) -> impl Iterator<Item = &str> {
        self.exclusive_files
            .iter()
            .chain(self.shared_files.iter())
            .map(|s| s.as_str())
    }

    /// Two tasks conflict when either side's exclusive set intersects the
    /// other side's touched set.
    pub fn files_conflict_with(&self, other: &Task) -> bool {
        let hits = |exclusive: &[String], touched: &Task| {
            exclusive
                .iter()
                .any(|p| touched.touched_files().any(|q| q == p))
        };
        hits(&self.exclusive_files, other) || hits(&other.exclusive_files, self)
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        match status {
            TaskStatus::Completed => self.completed_at = Some(Utc::now()),
            TaskStatus::Merged => self.merged_at = Some(Utc::now()),
            _ => {}
        }
    }
}

/// Derive a stable task id from a title: lowercase letters, digits, and
/// hyphens only, with runs of other characters collapsed to one hyphen.
pub fn task_id_from_title(title: &str) -> String {
    let mut id = String::with_capacity(title.len());
    let mut last_hyphen = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            id.push('-');
            last_hyphen = true;
        }
    }
    while id.ends_with('-') {
        id.pop();
    }
    if id.is_empty() {
        id.push_str("task");
    }
    id
}

/// Validate a branch name: non-empty, no separators or shell
/// metacharacters, no whitespace or control characters.
pub fn validate_branch_name(branch: &str) -> Result<(), String> {
    if branch.is_empty() {
        return Err("branch name is empty".to_string());
    }
    for c in branch.chars() {
        if c == '/' || c == '&' || c == '\\' {
            return Err(format!("branch contains forbidden character {c:?}"));
        }
        if c.is_whitespace() || c.is_control() {
            return Err("branch contains whitespace or control character".to_string());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Todo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub id: Uuid,
    pub text: String,
    pub status: TodoStatus,
    pub priority: i64,
}

impl Todo {
    pub fn new(text: impl Into<String>, priority: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            status: TodoStatus::Pending,
            priority,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentRecord
// ---------------------------------------------------------------------------

/// A live agent as seen by the coordination registry. Exists from
/// `register_agent` until `unregister_agent` or heartbeat expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub session_name: String,
    pub task_id: String,
    pub branch: String,
    pub description: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub held_locks: Vec<String>,
    pub todos: Vec<Todo>,
}

impl AgentRecord {
    pub fn new(
        session_name: impl Into<String>,
        task_id: impl Into<String>,
        branch: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_name: session_name.into(),
            task_id: task_id.into(),
            branch: branch.into(),
            description: description.into(),
            registered_at: now,
            last_heartbeat: now,
            held_locks: Vec::new(),
            todos: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// FileLock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub path: String,
    pub session_name: String,
    pub acquired_at: DateTime<Utc>,
    pub change_type: ChangeType,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// SharedInterface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedInterface {
    pub name: String,
    pub definition: String,
    pub owner_session: String,
    pub registered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from: String,
    /// `None` means broadcast to every live agent.
    pub to: Option<String>,
    pub kind: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CoordinationEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationEventKind {
    AgentRegistered,
    AgentHeartbeat,
    AgentUnregistered,
    TodoAdded,
    TodoUpdated,
    TodoCompleted,
    FileLocked,
    FileUnlocked,
    InterfaceRegistered,
    MessageSent,
    TaskCompletedSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub kind: CoordinationEventKind,
    pub agent: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl CoordinationEvent {
    pub fn new(kind: CoordinationEventKind, agent: impl Into<String>) -> Self {
        Self {
            kind,
            agent: agent.into(),
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_state_machine() {
        use TaskStatus::*;
        assert!(Unclaimed.can_transition_to(&UpNext));
        assert!(UpNext.can_transition_to(&InProgress));
        assert!(InProgress.can_transition_to(&Completed));
        assert!(Completed.can_transition_to(&Merged));

        // resets
        assert!(UpNext.can_transition_to(&Unclaimed));
        assert!(InProgress.can_transition_to(&Unclaimed));
        assert!(Completed.can_transition_to(&Unclaimed));
        assert!(Merged.can_transition_to(&Unclaimed));

        // invalid jumps
        assert!(!Unclaimed.can_transition_to(&InProgress));
        assert!(!Unclaimed.can_transition_to(&Merged));
        assert!(!UpNext.can_transition_to(&Completed));
        assert!(!Merged.can_transition_to(&Completed));
        assert!(!Unclaimed.can_transition_to(&Unclaimed));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            TaskStatus::Unclaimed,
            TaskStatus::UpNext,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Merged,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("DONE"), None);
    }

    #[test]
    fn id_from_title_sanitizes() {
        assert_eq!(task_id_from_title("Add login page!"), "add-login-page");
        assert_eq!(task_id_from_title("fix/bug #42"), "fix-bug-42");
        assert_eq!(task_id_from_title("***"), "task");
    }

    #[test]
    fn branch_validation_rejects_bad_names() {
        assert!(validate_branch_name("feature-auth").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("a/b").is_err());
        assert!(validate_branch_name("a&b").is_err());
        assert!(validate_branch_name("a b").is_err());
        assert!(validate_branch_name("a\tb").is_err());
    }

    #[test]
    fn file_conflict_is_symmetric() {
        let mut a = Task::new("A", "a");
        let mut b = Task::new("B", "b");
        a.exclusive_files = vec!["config.json".into()];
        b.shared_files = vec!["config.json".into()];
        assert!(a.files_conflict_with(&b));
        assert!(b.files_conflict_with(&a));

        b.shared_files.clear();
        b.exclusive_files = vec!["other.rs".into()];
        assert!(!a.files_conflict_with(&b));
    }

    #[test]
    fn set_status_stamps_timestamps() {
        let mut t = Task::new("T", "t");
        assert!(t.completed_at.is_none());
        t.set_status(TaskStatus::Completed);
        assert!(t.completed_at.is_some());
        t.set_status(TaskStatus::Merged);
        assert!(t.merged_at.is_some());
    }
}

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sm_core::types::{
    AgentRecord, ChangeType, CoordinationEvent, CoordinationEventKind, FileLock, Message,
    SharedInterface, Todo, TodoStatus,
};

pub const DEFAULT_MESSAGE_CAPACITY: usize = 1_000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("file {path} is locked by {holder}")]
    Conflict { path: String, holder: String },
    #[error("caller does not hold the lock on {path}")]
    NotHolder { path: String },
    #[error("interface {name} is owned by {owner}")]
    Forbidden { name: String, owner: String },
    #[error("unknown todo: {0}")]
    UnknownTodo(Uuid),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

// ---------------------------------------------------------------------------
// CoordinationRegistry
// ---------------------------------------------------------------------------

struct MessageLog {
    ring: VecDeque<(u64, Message)>,
    next_seq: u64,
}

/// Keyed in-memory store of live agents, file locks, shared interface
/// definitions, and a bounded message log.
///
/// Lock acquisition is a compare-and-set on the per-path map entry, so
/// concurrent agents racing for one path are totally ordered. All
/// observable mutations are mirrored onto an optional event sink.
pub struct CoordinationRegistry {
    agents: DashMap<String, AgentRecord>,
    locks: DashMap<String, FileLock>,
    interfaces: DashMap<String, SharedInterface>,
    messages: Mutex<MessageLog>,
    /// Per-session read cursor into the message sequence.
    cursors: DashMap<String, u64>,
    message_capacity: usize,
    events: Mutex<Option<flume::Sender<CoordinationEvent>>>,
}

impl CoordinationRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MESSAGE_CAPACITY)
    }

    pub fn with_capacity(message_capacity: usize) -> Self {
        Self {
            agents: DashMap::new(),
            locks: DashMap::new(),
            interfaces: DashMap::new(),
            messages: Mutex::new(MessageLog {
                ring: VecDeque::new(),
                next_seq: 0,
            }),
            cursors: DashMap::new(),
            message_capacity,
            events: Mutex::new(None),
        }
    }

    /// Route coordination events into the given channel (the orchestrator
    /// forwards them onto the event bus).
    pub fn set_event_sink(&self, tx: flume::Sender<CoordinationEvent>) {
        *self.events.lock().expect("event sink lock") = Some(tx);
    }

    fn emit(&self, event: CoordinationEvent) {
        if let Some(tx) = self.events.lock().expect("event sink lock").as_ref() {
            let _ = tx.send(event);
        }
    }

    // -- presence ----------------------------------------------------------

    /// Register a session. Idempotent: re-registering refreshes the
    /// heartbeat instead of erroring.
    pub fn register_agent(
        &self,
        session_name: &str,
        task_id: &str,
        branch: &str,
        description: &str,
    ) -> AgentRecord {
        let record = match self.agents.entry(session_name.to_string()) {
            Entry::Occupied(mut e) => {
                let rec = e.get_mut();
                rec.last_heartbeat = Utc::now();
                rec.clone()
            }
            Entry::Vacant(e) => {
                let rec = AgentRecord::new(session_name, task_id, branch, description);
                e.insert(rec.clone());
                info!(session = session_name, task_id, "agent registered");
                rec
            }
        };
        self.emit(
            CoordinationEvent::new(CoordinationEventKind::AgentRegistered, session_name)
                .with_payload(json!({"task_id": task_id, "branch": branch})),
        );
        record
    }

    /// Remove a session and atomically release every lock it held.
    pub fn unregister_agent(&self, session_name: &str) -> Result<()> {
        let record = self
            .agents
            .remove(session_name)
            .map(|(_, r)| r)
            .ok_or_else(|| RegistryError::UnknownAgent(session_name.to_string()))?;
        self.release_all_locks(session_name);
        self.cursors.remove(session_name);
        info!(session = session_name, task_id = %record.task_id, "agent unregistered");
        self.emit(CoordinationEvent::new(
            CoordinationEventKind::AgentUnregistered,
            session_name,
        ));
        Ok(())
    }

    pub fn heartbeat(&self, session_name: &str) -> Result<()> {
        let mut rec = self
            .agents
            .get_mut(session_name)
            .ok_or_else(|| RegistryError::UnknownAgent(session_name.to_string()))?;
        rec.last_heartbeat = Utc::now();
        self.emit(CoordinationEvent::new(
            CoordinationEventKind::AgentHeartbeat,
            session_name,
        ));
        Ok(())
    }

    pub fn list_active_agents(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.agents.iter().map(|e| e.value().clone()).collect();
        agents.sort_by(|a, b| a.session_name.cmp(&b.session_name));
        agents
    }

    pub fn get_agent(&self, session_name: &str) -> Option<AgentRecord> {
        self.agents.get(session_name).map(|e| e.clone())
    }

    /// Sessions whose last heartbeat is older than `ttl`. Does not mutate;
    /// the orchestrator decides what to do with them.
    pub fn stale_agents(&self, ttl: Duration) -> Vec<AgentRecord> {
        let now = Utc::now();
        self.agents
            .iter()
            .filter(|e| {
                now.signed_duration_since(e.value().last_heartbeat)
                    .to_std()
                    .map(|elapsed| elapsed > ttl)
                    .unwrap_or(false)
            })
            .map(|e| e.value().clone())
            .collect()
    }

    /// Remove a dead session and release its locks; used after heartbeat
    /// expiry. Unlike `unregister_agent`, missing sessions are tolerated.
    pub fn reap_agent(&self, session_name: &str) {
        if self.agents.remove(session_name).is_some() {
            warn!(session = session_name, "reaping dead agent");
            self.release_all_locks(session_name);
            self.cursors.remove(session_name);
            self.emit(CoordinationEvent::new(
                CoordinationEventKind::AgentUnregistered,
                session_name,
            ));
        }
    }

    // -- todos -------------------------------------------------------------

    pub fn add_todo(&self, session_name: &str, text: &str, priority: i64) -> Result<Todo> {
        let mut rec = self
            .agents
            .get_mut(session_name)
            .ok_or_else(|| RegistryError::UnknownAgent(session_name.to_string()))?;
        let todo = Todo::new(text, priority);
        rec.todos.push(todo.clone());
        drop(rec);
        self.emit(
            CoordinationEvent::new(CoordinationEventKind::TodoAdded, session_name)
                .with_payload(json!({"todo_id": todo.id, "text": text})),
        );
        Ok(todo)
    }

    pub fn update_todo(
        &self,
        session_name: &str,
        todo_id: Uuid,
        text: Option<String>,
        status: Option<TodoStatus>,
    ) -> Result<Todo> {
        let mut rec = self
            .agents
            .get_mut(session_name)
            .ok_or_else(|| RegistryError::UnknownAgent(session_name.to_string()))?;
        let todo = rec
            .todos
            .iter_mut()
            .find(|t| t.id == todo_id)
            .ok_or(RegistryError::UnknownTodo(todo_id))?;
        if let Some(text) = text {
            todo.text = text;
        }
        if let Some(status) = status {
            todo.status = status;
        }
        let updated = todo.clone();
        drop(rec);
        let kind = if updated.status == TodoStatus::Completed {
            CoordinationEventKind::TodoCompleted
        } else {
            CoordinationEventKind::TodoUpdated
        };
        self.emit(
            CoordinationEvent::new(kind, session_name)
                .with_payload(json!({"todo_id": updated.id})),
        );
        Ok(updated)
    }

    pub fn complete_todo(&self, session_name: &str, todo_id: Uuid) -> Result<Todo> {
        self.update_todo(session_name, todo_id, None, Some(TodoStatus::Completed))
    }

    pub fn get_todos(&self, session_name: &str) -> Result<Vec<Todo>> {
        let rec = self
            .agents
            .get(session_name)
            .ok_or_else(|| RegistryError::UnknownAgent(session_name.to_string()))?;
        Ok(rec.todos.clone())
    }

    // -- file locks --------------------------------------------------------

    /// Acquire the lock on `path` for `session_name`. Fails with
    /// `Conflict` when another live session holds it; re-announcing a path
    /// the caller already holds refreshes the lock.
    pub fn announce_file_change(
        &self,
        session_name: &str,
        path: &str,
        change_type: ChangeType,
        reason: &str,
    ) -> Result<FileLock> {
        if !self.agents.contains_key(session_name) {
            return Err(RegistryError::UnknownAgent(session_name.to_string()));
        }

        // The entry API holds the shard for the duration, making this a
        // compare-and-set per path.
        let lock = match self.locks.entry(path.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().session_name != session_name {
                    return Err(RegistryError::Conflict {
                        path: path.to_string(),
                        holder: e.get().session_name.clone(),
                    });
                }
                let lock = e.get_mut();
                lock.change_type = change_type;
                lock.reason = reason.to_string();
                lock.clone()
            }
            Entry::Vacant(e) => {
                let lock = FileLock {
                    path: path.to_string(),
                    session_name: session_name.to_string(),
                    acquired_at: Utc::now(),
                    change_type,
                    reason: reason.to_string(),
                };
                e.insert(lock.clone());
                lock
            }
        };

        if let Some(mut rec) = self.agents.get_mut(session_name) {
            if !rec.held_locks.iter().any(|p| p == path) {
                rec.held_locks.push(path.to_string());
            }
        }

        debug!(session = session_name, path, "file lock acquired");
        self.emit(
            CoordinationEvent::new(CoordinationEventKind::FileLocked, session_name)
                .with_payload(json!({"path": path, "change_type": change_type})),
        );
        Ok(lock)
    }

    pub fn release_file_lock(&self, session_name: &str, path: &str) -> Result<()> {
        match self.locks.entry(path.to_string()) {
            Entry::Occupied(e) => {
                if e.get().session_name != session_name {
                    return Err(RegistryError::NotHolder {
                        path: path.to_string(),
                    });
                }
                e.remove();
            }
            Entry::Vacant(_) => {
                return Err(RegistryError::NotHolder {
                    path: path.to_string(),
                });
            }
        }
        if let Some(mut rec) = self.agents.get_mut(session_name) {
            rec.held_locks.retain(|p| p != path);
        }
        debug!(session = session_name, path, "file lock released");
        self.emit(
            CoordinationEvent::new(CoordinationEventKind::FileUnlocked, session_name)
                .with_payload(json!({"path": path})),
        );
        Ok(())
    }

    pub fn check_file_lock(&self, path: &str) -> Option<FileLock> {
        self.locks.get(path).map(|e| e.clone())
    }

    pub fn list_file_locks(&self) -> Vec<FileLock> {
        let mut locks: Vec<FileLock> = self.locks.iter().map(|e| e.value().clone()).collect();
        locks.sort_by(|a, b| a.path.cmp(&b.path));
        locks
    }

    /// Which of the given paths are currently locked (merge-queue query).
    pub fn locked_paths_among<'a>(&self, paths: impl Iterator<Item = &'a str>) -> Vec<String> {
        paths
            .filter(|p| self.locks.contains_key(*p))
            .map(|p| p.to_string())
            .collect()
    }

    fn release_all_locks(&self, session_name: &str) {
        let held: Vec<String> = self
            .locks
            .iter()
            .filter(|e| e.value().session_name == session_name)
            .map(|e| e.key().clone())
            .collect();
        for path in held {
            self.locks.remove(&path);
            self.emit(
                CoordinationEvent::new(CoordinationEventKind::FileUnlocked, session_name)
                    .with_payload(json!({"path": path})),
            );
        }
    }

    // -- interfaces --------------------------------------------------------

    /// Register (or, as the current owner, replace) a shared interface
    /// definition.
    pub fn register_interface(
        &self,
        session_name: &str,
        name: &str,
        definition: &str,
    ) -> Result<SharedInterface> {
        if !self.agents.contains_key(session_name) {
            return Err(RegistryError::UnknownAgent(session_name.to_string()));
        }
        let iface = match self.interfaces.entry(name.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().owner_session != session_name {
                    return Err(RegistryError::Forbidden {
                        name: name.to_string(),
                        owner: e.get().owner_session.clone(),
                    });
                }
                let iface = e.get_mut();
                iface.definition = definition.to_string();
                iface.clone()
            }
            Entry::Vacant(e) => {
                let iface = SharedInterface {
                    name: name.to_string(),
                    definition: definition.to_string(),
                    owner_session: session_name.to_string(),
                    registered_at: Utc::now(),
                };
                e.insert(iface.clone());
                iface
            }
        };
        self.emit(
            CoordinationEvent::new(CoordinationEventKind::InterfaceRegistered, session_name)
                .with_payload(json!({"name": name})),
        );
        Ok(iface)
    }

    pub fn query_interface(&self, name: &str) -> Option<SharedInterface> {
        self.interfaces.get(name).map(|e| e.clone())
    }

    pub fn list_interfaces(&self) -> Vec<SharedInterface> {
        let mut ifaces: Vec<SharedInterface> =
            self.interfaces.iter().map(|e| e.value().clone()).collect();
        ifaces.sort_by(|a, b| a.name.cmp(&b.name));
        ifaces
    }

    // -- messages ----------------------------------------------------------

    /// Append a message; `to = None` broadcasts.
    pub fn send_message(
        &self,
        from: &str,
        to: Option<&str>,
        kind: &str,
        body: &str,
    ) -> Result<Message> {
        if !self.agents.contains_key(from) {
            return Err(RegistryError::UnknownAgent(from.to_string()));
        }
        let message = Message {
            id: Uuid::new_v4(),
            from: from.to_string(),
            to: to.map(|s| s.to_string()),
            kind: kind.to_string(),
            body: body.to_string(),
            timestamp: Utc::now(),
        };
        {
            let mut log = self.messages.lock().expect("message log lock");
            let seq = log.next_seq;
            log.next_seq += 1;
            log.ring.push_back((seq, message.clone()));
            while log.ring.len() > self.message_capacity {
                log.ring.pop_front();
            }
        }
        self.emit(
            CoordinationEvent::new(CoordinationEventKind::MessageSent, from)
                .with_payload(json!({"to": to, "kind": kind})),
        );
        Ok(message)
    }

    /// Return messages addressed to `session_name` (or broadcast) that it
    /// has not seen yet, advancing its read cursor.
    pub fn check_messages(&self, session_name: &str) -> Result<Vec<Message>> {
        if !self.agents.contains_key(session_name) {
            return Err(RegistryError::UnknownAgent(session_name.to_string()));
        }
        let log = self.messages.lock().expect("message log lock");
        let cursor = self.cursors.get(session_name).map(|c| *c).unwrap_or(0);
        let out: Vec<Message> = log
            .ring
            .iter()
            .filter(|(seq, _)| *seq >= cursor)
            .filter(|(_, m)| {
                m.from != session_name
                    && m.to.as_deref().map(|t| t == session_name).unwrap_or(true)
            })
            .map(|(_, m)| m.clone())
            .collect();
        // Everything up to the end of the log counts as read for this
        // session, including messages it was never addressed by.
        self.cursors.insert(session_name.to_string(), log.next_seq);
        Ok(out)
    }

    // -- completion signal -------------------------------------------------

    /// The agent's in-band completion signal, mirrored as an event for the
    /// orchestrator loop.
    pub fn mark_task_completed(&self, session_name: &str) -> Result<String> {
        let rec = self
            .agents
            .get(session_name)
            .ok_or_else(|| RegistryError::UnknownAgent(session_name.to_string()))?;
        let task_id = rec.task_id.clone();
        drop(rec);
        info!(session = session_name, task_id = %task_id, "agent signalled completion");
        self.emit(
            CoordinationEvent::new(CoordinationEventKind::TaskCompletedSignal, session_name)
                .with_payload(json!({"task_id": task_id})),
        );
        Ok(task_id)
    }

    // -- stats -------------------------------------------------------------

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_agents: self.agents.len(),
            held_locks: self.locks.len(),
            interfaces: self.interfaces.len(),
            messages_retained: self.messages.lock().expect("message log lock").ring.len(),
        }
    }
}

impl Default for CoordinationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_agents: usize,
    pub held_locks: usize,
    pub interfaces: usize,
    pub messages_retained: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_agents(names: &[&str]) -> CoordinationRegistry {
        let reg = CoordinationRegistry::new();
        for n in names {
            reg.register_agent(n, &format!("task-{n}"), &format!("branch-{n}"), "test");
        }
        reg
    }

    #[test]
    fn register_is_idempotent_and_refreshes_heartbeat() {
        let reg = CoordinationRegistry::new();
        let first = reg.register_agent("s1", "t1", "b1", "d");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = reg.register_agent("s1", "t1", "b1", "d");
        assert_eq!(reg.list_active_agents().len(), 1);
        assert!(second.last_heartbeat >= first.last_heartbeat);
    }

    #[test]
    fn lock_contention_reports_holder() {
        let reg = registry_with_agents(&["s1", "s2"]);
        reg.announce_file_change("s1", "config.ts", ChangeType::Modify, "editing")
            .unwrap();

        match reg.announce_file_change("s2", "config.ts", ChangeType::Modify, "editing") {
            Err(RegistryError::Conflict { holder, path }) => {
                assert_eq!(holder, "s1");
                assert_eq!(path, "config.ts");
            }
            other => panic!("expected Conflict, got {other:?}"),
        }

        // After release, the retry succeeds.
        reg.release_file_lock("s1", "config.ts").unwrap();
        reg.announce_file_change("s2", "config.ts", ChangeType::Modify, "editing")
            .unwrap();
        assert_eq!(
            reg.check_file_lock("config.ts").unwrap().session_name,
            "s2"
        );
    }

    #[test]
    fn release_by_non_holder_is_rejected() {
        let reg = registry_with_agents(&["s1", "s2"]);
        reg.announce_file_change("s1", "a.rs", ChangeType::Create, "new file")
            .unwrap();
        match reg.release_file_lock("s2", "a.rs") {
            Err(RegistryError::NotHolder { path }) => assert_eq!(path, "a.rs"),
            other => panic!("expected NotHolder, got {other:?}"),
        }
        match reg.release_file_lock("s1", "missing.rs") {
            Err(RegistryError::NotHolder { .. }) => {}
            other => panic!("expected NotHolder, got {other:?}"),
        }
    }

    #[test]
    fn unregister_releases_all_locks() {
        let reg = registry_with_agents(&["s1", "s2"]);
        reg.announce_file_change("s1", "a.rs", ChangeType::Modify, "")
            .unwrap();
        reg.announce_file_change("s1", "b.rs", ChangeType::Modify, "")
            .unwrap();

        reg.unregister_agent("s1").unwrap();
        assert!(reg.check_file_lock("a.rs").is_none());
        assert!(reg.check_file_lock("b.rs").is_none());

        // Both paths are free for s2 now.
        reg.announce_file_change("s2", "a.rs", ChangeType::Modify, "")
            .unwrap();
    }

    #[test]
    fn reap_tolerates_missing_agent() {
        let reg = registry_with_agents(&["s1"]);
        reg.reap_agent("ghost");
        reg.reap_agent("s1");
        assert!(reg.list_active_agents().is_empty());
    }

    #[test]
    fn stale_agents_detects_old_heartbeats() {
        let reg = registry_with_agents(&["s1"]);
        assert!(reg.stale_agents(Duration::from_secs(60)).is_empty());
        assert_eq!(reg.stale_agents(Duration::from_nanos(1)).len(), 1);
    }

    #[test]
    fn interface_replacement_requires_ownership() {
        let reg = registry_with_agents(&["s1", "s2"]);
        reg.register_interface("s1", "UserApi", "trait UserApi { fn get(&self); }")
            .unwrap();

        match reg.register_interface("s2", "UserApi", "something else") {
            Err(RegistryError::Forbidden { owner, .. }) => assert_eq!(owner, "s1"),
            other => panic!("expected Forbidden, got {other:?}"),
        }

        // The owner may replace its own definition.
        let updated = reg
            .register_interface("s1", "UserApi", "trait UserApi { fn get_v2(&self); }")
            .unwrap();
        assert!(updated.definition.contains("get_v2"));
    }

    #[test]
    fn messages_are_cursor_tracked_per_session() {
        let reg = registry_with_agents(&["s1", "s2", "s3"]);
        reg.send_message("s1", None, "status", "broadcast one")
            .unwrap();
        reg.send_message("s1", Some("s2"), "direct", "for s2 only")
            .unwrap();

        let s2_msgs = reg.check_messages("s2").unwrap();
        assert_eq!(s2_msgs.len(), 2);

        // s3 sees only the broadcast.
        let s3_msgs = reg.check_messages("s3").unwrap();
        assert_eq!(s3_msgs.len(), 1);
        assert_eq!(s3_msgs[0].body, "broadcast one");

        // Cursor advanced: nothing new.
        assert!(reg.check_messages("s2").unwrap().is_empty());

        reg.send_message("s3", Some("s2"), "direct", "later").unwrap();
        let s2_more = reg.check_messages("s2").unwrap();
        assert_eq!(s2_more.len(), 1);
        assert_eq!(s2_more[0].body, "later");
    }

    #[test]
    fn message_ring_is_bounded() {
        let reg = CoordinationRegistry::with_capacity(5);
        reg.register_agent("s1", "t", "b", "");
        for i in 0..10 {
            reg.send_message("s1", None, "spam", &format!("m{i}")).unwrap();
        }
        assert_eq!(reg.stats().messages_retained, 5);
    }

    #[test]
    fn mark_task_completed_returns_task_id() {
        let reg = registry_with_agents(&["s1"]);
        assert_eq!(reg.mark_task_completed("s1").unwrap(), "task-s1");
        assert!(reg.mark_task_completed("ghost").is_err());
    }

    #[test]
    fn events_flow_to_sink() {
        let reg = CoordinationRegistry::new();
        let (tx, rx) = flume::unbounded();
        reg.set_event_sink(tx);

        reg.register_agent("s1", "t1", "b1", "");
        reg.announce_file_change("s1", "x.rs", ChangeType::Modify, "")
            .unwrap();
        reg.unregister_agent("s1").unwrap();

        let kinds: Vec<CoordinationEventKind> = rx.drain().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CoordinationEventKind::AgentRegistered,
                CoordinationEventKind::FileLocked,
                CoordinationEventKind::FileUnlocked,
                CoordinationEventKind::AgentUnregistered,
            ]
        );
    }

    #[test]
    fn locked_paths_among_filters() {
        let reg = registry_with_agents(&["s1"]);
        reg.announce_file_change("s1", "a.rs", ChangeType::Modify, "")
            .unwrap();
        let locked =
            reg.locked_paths_among(["a.rs", "b.rs"].into_iter());
        assert_eq!(locked, vec!["a.rs"]);
    }

    #[test]
    fn todos_lifecycle() {
        let reg = registry_with_agents(&["s1"]);
        let todo = reg.add_todo("s1", "write tests", 1).unwrap();
        assert_eq!(todo.status, TodoStatus::Pending);

        reg.update_todo("s1", todo.id, None, Some(TodoStatus::InProgress))
            .unwrap();
        let done = reg.complete_todo("s1", todo.id).unwrap();
        assert_eq!(done.status, TodoStatus::Completed);

        let todos = reg.get_todos("s1").unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].status, TodoStatus::Completed);
    }
}

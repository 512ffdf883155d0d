use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sm_core::types::{CoordinationEvent, Task};

// ---------------------------------------------------------------------------
// ResetReason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    UserReset,
    SpawnFailed,
    HeartbeatTimeout,
    AgentFailed,
    MergeConflict,
    DependencyInvalid,
}

// ---------------------------------------------------------------------------
// OrchestratorEvent
// ---------------------------------------------------------------------------

/// Everything observable on the live stream. Each variant corresponds to
/// a durable state change (the task store is written before the event is
/// published) or a coordination-registry mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum OrchestratorEvent {
    TaskCreated(Task),
    TaskUpdated(Task),
    TaskDeleted {
        task_id: String,
    },
    TaskReset {
        task_id: String,
        reason: ResetReason,
    },
    TaskCompleted {
        task_id: String,
        session: String,
    },
    TaskBlocked {
        task_id: String,
        attempts: u32,
    },
    SpawnFailed {
        task_id: String,
        error: String,
    },
    MergeStarted {
        task_id: String,
        branch: String,
    },
    MergeCompleted {
        task_id: String,
        branch: String,
    },
    MergeFailed {
        task_id: String,
        branch: String,
        reason: String,
        conflicts: Vec<String>,
    },
    Coordination(CoordinationEvent),
    OrchestratorStarted {
        project_id: String,
    },
    OrchestratorStopped {
        project_id: String,
    },
    /// Unrecoverable failure: the loop has halted, the control plane stays
    /// reachable for inspection.
    Fatal {
        message: String,
    },
    Error {
        kind: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_s: Option<u64>,
    },
}

impl OrchestratorEvent {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorEvent::TaskCreated(_) => "task_created",
            OrchestratorEvent::TaskUpdated(_) => "task_updated",
            OrchestratorEvent::TaskDeleted { .. } => "task_deleted",
            OrchestratorEvent::TaskReset { .. } => "task_reset",
            OrchestratorEvent::TaskCompleted { .. } => "task_completed",
            OrchestratorEvent::TaskBlocked { .. } => "task_blocked",
            OrchestratorEvent::SpawnFailed { .. } => "spawn_failed",
            OrchestratorEvent::MergeStarted { .. } => "merge_started",
            OrchestratorEvent::MergeCompleted { .. } => "merge_completed",
            OrchestratorEvent::MergeFailed { .. } => "merge_failed",
            OrchestratorEvent::Coordination(_) => "coordination",
            OrchestratorEvent::OrchestratorStarted { .. } => "orchestrator_started",
            OrchestratorEvent::OrchestratorStopped { .. } => "orchestrator_stopped",
            OrchestratorEvent::Fatal { .. } => "fatal",
            OrchestratorEvent::Error { .. } => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// ControlCommand
// ---------------------------------------------------------------------------

/// Commands the HTTP layer hands to a project's orchestrator loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    Stop,
    ResetTask { task_id: String },
    EnqueueMerge { task_id: String },
    /// Clears a merge-queue pause caused by the `abort` conflict policy.
    AcknowledgeMergeFailure,
}

// ---------------------------------------------------------------------------
// StatusPayload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub version: String,
    pub uptime_seconds: u64,
    pub projects: Vec<ProjectStatus>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub id: String,
    pub orchestrator_running: bool,
    pub tasks: usize,
    pub active_agents: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = OrchestratorEvent::TaskReset {
            task_id: "a".to_string(),
            reason: ResetReason::HeartbeatTimeout,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_reset");
        assert_eq!(json["payload"]["reason"], "heartbeat_timeout");
    }

    #[test]
    fn commands_round_trip() {
        let cmd = ControlCommand::EnqueueMerge {
            task_id: "a".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: ControlCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn kind_labels_match_tags() {
        let event = OrchestratorEvent::MergeFailed {
            task_id: "a".into(),
            branch: "b".into(),
            reason: "conflict".into(),
            conflicts: vec![],
        };
        assert_eq!(event.kind(), "merge_failed");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind());
    }
}

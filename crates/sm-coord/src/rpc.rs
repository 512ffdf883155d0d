//! The agent-facing RPC surface.
//!
//! Agent subprocesses call these operations over the control plane
//! (`POST /projects/{id}/coordination/rpc`) with a tagged `op` body.
//! Every call returns a structured result with an explicit success/error
//! discriminator; errors never become transport-level failures.

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use sm_core::types::{ChangeType, TodoStatus};

use crate::registry::{CoordinationRegistry, RegistryError};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RpcRequest {
    RegisterAgent {
        session_name: String,
        task_id: String,
        branch: String,
        #[serde(default)]
        description: String,
    },
    UnregisterAgent {
        session_name: String,
    },
    Heartbeat {
        session_name: String,
    },
    ListActiveAgents,
    AddTodo {
        session_name: String,
        text: String,
        #[serde(default)]
        priority: i64,
    },
    UpdateTodo {
        session_name: String,
        todo_id: Uuid,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        status: Option<TodoStatus>,
    },
    CompleteTodo {
        session_name: String,
        todo_id: Uuid,
    },
    GetTodos {
        session_name: String,
    },
    AnnounceFileChange {
        session_name: String,
        path: String,
        change_type: ChangeType,
        #[serde(default)]
        reason: String,
    },
    ReleaseFileLock {
        session_name: String,
        path: String,
    },
    CheckFileLock {
        path: String,
    },
    ListFileLocks,
    RegisterInterface {
        session_name: String,
        name: String,
        definition: String,
    },
    QueryInterface {
        name: String,
    },
    ListInterfaces,
    SendMessage {
        session_name: String,
        to: String,
        #[serde(default = "default_message_kind")]
        kind: String,
        body: String,
    },
    BroadcastMessage {
        session_name: String,
        body: String,
    },
    CheckMessages {
        session_name: String,
    },
    MarkTaskCompleted {
        session_name: String,
    },
}

fn default_message_kind() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorKind {
    UnknownAgent,
    Conflict,
    NotHolder,
    Forbidden,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<RpcErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The lock holder, present on `Conflict` results so the caller can
    /// coordinate directly with it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl RpcResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            kind: None,
            message: None,
            holder: None,
            data,
        }
    }

    fn err(kind: RpcErrorKind, message: String, holder: Option<String>) -> Self {
        Self {
            success: false,
            kind: Some(kind),
            message: Some(message),
            holder,
            data: serde_json::Value::Null,
        }
    }
}

impl From<RegistryError> for RpcResponse {
    fn from(e: RegistryError) -> Self {
        let message = e.to_string();
        match e {
            RegistryError::UnknownAgent(_) => {
                RpcResponse::err(RpcErrorKind::UnknownAgent, message, None)
            }
            RegistryError::Conflict { holder, .. } => {
                RpcResponse::err(RpcErrorKind::Conflict, message, Some(holder))
            }
            RegistryError::NotHolder { .. } => {
                RpcResponse::err(RpcErrorKind::NotHolder, message, None)
            }
            RegistryError::Forbidden { .. } => {
                RpcResponse::err(RpcErrorKind::Forbidden, message, None)
            }
            RegistryError::UnknownTodo(_) => {
                RpcResponse::err(RpcErrorKind::NotFound, message, None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Execute one RPC against the registry. Infallible at this layer: every
/// outcome is encoded in the `RpcResponse`.
pub fn dispatch(registry: &CoordinationRegistry, request: RpcRequest) -> RpcResponse {
    fn respond<T: Serialize>(result: Result<T, RegistryError>) -> RpcResponse {
        match result {
            Ok(value) => RpcResponse::ok(serde_json::to_value(value).unwrap_or_default()),
            Err(e) => e.into(),
        }
    }

    match request {
        RpcRequest::RegisterAgent {
            session_name,
            task_id,
            branch,
            description,
        } => {
            let record = registry.register_agent(&session_name, &task_id, &branch, &description);
            RpcResponse::ok(serde_json::to_value(record).unwrap_or_default())
        }
        RpcRequest::UnregisterAgent { session_name } => {
            respond(registry.unregister_agent(&session_name).map(|_| json!({})))
        }
        RpcRequest::Heartbeat { session_name } => {
            respond(registry.heartbeat(&session_name).map(|_| json!({})))
        }
        RpcRequest::ListActiveAgents => {
            RpcResponse::ok(serde_json::to_value(registry.list_active_agents()).unwrap_or_default())
        }
        RpcRequest::AddTodo {
            session_name,
            text,
            priority,
        } => respond(registry.add_todo(&session_name, &text, priority)),
        RpcRequest::UpdateTodo {
            session_name,
            todo_id,
            text,
            status,
        } => respond(registry.update_todo(&session_name, todo_id, text, status)),
        RpcRequest::CompleteTodo {
            session_name,
            todo_id,
        } => respond(registry.complete_todo(&session_name, todo_id)),
        RpcRequest::GetTodos { session_name } => respond(registry.get_todos(&session_name)),
        RpcRequest::AnnounceFileChange {
            session_name,
            path,
            change_type,
            reason,
        } => respond(registry.announce_file_change(&session_name, &path, change_type, &reason)),
        RpcRequest::ReleaseFileLock { session_name, path } => respond(
            registry
                .release_file_lock(&session_name, &path)
                .map(|_| json!({"path": path})),
        ),
        RpcRequest::CheckFileLock { path } => {
            RpcResponse::ok(serde_json::to_value(registry.check_file_lock(&path)).unwrap_or_default())
        }
        RpcRequest::ListFileLocks => {
            RpcResponse::ok(serde_json::to_value(registry.list_file_locks()).unwrap_or_default())
        }
        RpcRequest::RegisterInterface {
            session_name,
            name,
            definition,
        } => respond(registry.register_interface(&session_name, &name, &definition)),
        RpcRequest::QueryInterface { name } => {
            RpcResponse::ok(serde_json::to_value(registry.query_interface(&name)).unwrap_or_default())
        }
        RpcRequest::ListInterfaces => {
            RpcResponse::ok(serde_json::to_value(registry.list_interfaces()).unwrap_or_default())
        }
        RpcRequest::SendMessage {
            session_name,
            to,
            kind,
            body,
        } => respond(registry.send_message(&session_name, Some(&to), &kind, &body)),
        RpcRequest::BroadcastMessage { session_name, body } => {
            respond(registry.send_message(&session_name, None, "broadcast", &body))
        }
        RpcRequest::CheckMessages { session_name } => {
            respond(registry.check_messages(&session_name))
        }
        RpcRequest::MarkTaskCompleted { session_name } => respond(
            registry
                .mark_task_completed(&session_name)
                .map(|task_id| json!({"task_id": task_id})),
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

use sm_coord::registry::RegistryStats;
use sm_core::types::TaskStatus;
use sm_telemetry::metrics::CountersSnapshot;

// ---------------------------------------------------------------------------
// Request DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Defaults to the sanitized task id.
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub initialization_deps: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub merge_order: i64,
    #[serde(default)]
    pub exclusive_files: Vec<String>,
    #[serde(default)]
    pub shared_files: Vec<String>,
}

/// Partial update; absent fields are left alone. Status changes are
/// validated against the task state machine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub prompt: Option<String>,
    pub branch: Option<String>,
    pub status: Option<TaskStatus>,
    pub dependencies: Option<Vec<String>>,
    pub initialization_deps: Option<Vec<String>>,
    pub priority: Option<i64>,
    pub merge_order: Option<i64>,
    pub exclusive_files: Option<Vec<String>>,
    pub shared_files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteTaskQuery {
    #[serde(default)]
    pub force: bool,
}

// ---------------------------------------------------------------------------
// Response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TaskLogsResponse {
    pub task_id: String,
    pub session: String,
    pub attach_command: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinationStatsResponse {
    pub registry: RegistryStats,
    pub counters: CountersSnapshot,
    pub orchestrator_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedResponse {
    pub accepted: bool,
    pub detail: String,
}

impl AcceptedResponse {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            accepted: true,
            detail: detail.into(),
        }
    }
}

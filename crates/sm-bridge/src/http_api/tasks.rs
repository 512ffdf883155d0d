use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

use sm_core::types::{task_id_from_title, Task, TaskStatus};

use super::state::ApiState;
use super::types::{
    CreateTaskRequest, DeleteTaskQuery, TaskListQuery, TaskLogsResponse, UpdateTaskRequest,
};
use crate::api_error::ApiError;
use crate::protocol::{ControlCommand, OrchestratorEvent, ResetReason};

/// GET /projects/{id}/tasks: the full task list, optionally filtered by
/// status.
pub(crate) async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Path(project): Path<String>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let ctx = state.project(&project)?;
    let mut tasks = ctx.store.list().await;
    if let Some(ref status) = query.status {
        let Some(wanted) = TaskStatus::parse(status) else {
            return Err(ApiError::BadRequest(format!("unknown status {status:?}")));
        };
        tasks.retain(|t| t.status == wanted);
    }
    Ok(Json(tasks))
}

/// POST /projects/{id}/tasks: create a task. The server assigns the id
/// from the title and validates the branch.
pub(crate) async fn create_task(
    State(state): State<Arc<ApiState>>,
    Path(project): Path<String>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let ctx = state.project(&project)?;
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }

    let mut task = Task::new(req.title.trim(), "");
    task.id = unique_id(&ctx.store.list().await, &task_id_from_title(&req.title));
    task.branch = req.branch.unwrap_or_else(|| task.id.clone());
    task.description = req.description;
    task.prompt = req.prompt;
    task.dependencies = req.dependencies;
    task.initialization_deps = req.initialization_deps;
    task.priority = req.priority;
    task.merge_order = req.merge_order;
    task.exclusive_files = req.exclusive_files;
    task.shared_files = req.shared_files;

    ctx.store.insert(task.clone()).await?;
    let task = ctx
        .store
        .get(&task.id)
        .await
        .ok_or_else(|| ApiError::Internal("task vanished after insert".to_string()))?;
    ctx.publish(OrchestratorEvent::TaskCreated(task.clone()));
    Ok(Json(task))
}

/// PUT /projects/{id}/tasks/{tid}: patch fields; a status change goes
/// through the state machine.
pub(crate) async fn update_task(
    State(state): State<Arc<ApiState>>,
    Path((project, tid)): Path<(String, String)>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let ctx = state.project(&project)?;

    let mut task = ctx.store.update(&tid, |t| {
        if let Some(title) = req.title {
            t.title = title;
        }
        if let Some(description) = req.description {
            t.description = description;
        }
        if let Some(prompt) = req.prompt {
            t.prompt = Some(prompt);
        }
        if let Some(branch) = req.branch {
            t.branch = branch;
        }
        if let Some(dependencies) = req.dependencies {
            t.dependencies = dependencies;
        }
        if let Some(init_deps) = req.initialization_deps {
            t.initialization_deps = init_deps;
        }
        if let Some(priority) = req.priority {
            t.priority = priority;
        }
        if let Some(merge_order) = req.merge_order {
            t.merge_order = merge_order;
        }
        if let Some(exclusive) = req.exclusive_files {
            t.exclusive_files = exclusive;
        }
        if let Some(shared) = req.shared_files {
            t.shared_files = shared;
        }
    })
    .await?;

    if let Some(status) = req.status {
        if status != task.status {
            task = ctx.store.transition(&tid, status).await?;
        }
    }

    ctx.publish(OrchestratorEvent::TaskUpdated(task.clone()));
    Ok(Json(task))
}

/// DELETE /projects/{id}/tasks/{tid}: rejected while IN_PROGRESS unless
/// `?force=true`, in which case the session is killed first.
pub(crate) async fn delete_task(
    State(state): State<Arc<ApiState>>,
    Path((project, tid)): Path<(String, String)>,
    Query(query): Query<DeleteTaskQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ctx = state.project(&project)?;
    let task = ctx
        .store
        .get(&tid)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("task {tid}")))?;

    if task.status == TaskStatus::InProgress {
        if !query.force {
            return Err(ApiError::Conflict(format!(
                "task {tid} is in progress; pass force=true to delete anyway"
            )));
        }
        if let Some(session) = &task.session {
            let _ = ctx.runner.kill(session);
            ctx.registry.reap_agent(session);
        }
    }

    ctx.store.remove(&tid).await?;
    ctx.publish(OrchestratorEvent::TaskDeleted {
        task_id: tid.clone(),
    });
    Ok(Json(serde_json::json!({ "deleted": tid })))
}

/// POST /projects/{id}/tasks/{tid}/merge: hand a COMPLETED task to the
/// merge queue out of band.
pub(crate) async fn merge_task(
    State(state): State<Arc<ApiState>>,
    Path((project, tid)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ctx = state.project(&project)?;
    let task = ctx
        .store
        .get(&tid)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("task {tid}")))?;
    if task.status != TaskStatus::Completed {
        return Err(ApiError::Conflict(format!(
            "task {tid} is {}, only COMPLETED tasks can be merged",
            task.status
        )));
    }
    if !ctx.is_running() {
        return Err(ApiError::Conflict(
            "orchestrator is not running for this project".to_string(),
        ));
    }
    ctx.send_command(ControlCommand::EnqueueMerge { task_id: tid.clone() });
    Ok(Json(serde_json::json!({ "enqueued": tid })))
}

/// POST /projects/{id}/tasks/{tid}/reset: force a task back to
/// UNCLAIMED: kill its session, drop its locks, clear retry state.
pub(crate) async fn reset_task(
    State(state): State<Arc<ApiState>>,
    Path((project, tid)): Path<(String, String)>,
) -> Result<Json<Task>, ApiError> {
    let ctx = state.project(&project)?;
    let task = ctx
        .store
        .get(&tid)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("task {tid}")))?;

    if let Some(session) = &task.session {
        let _ = ctx.runner.kill(session);
        ctx.registry.reap_agent(session);
    }

    let updated = if task.status == TaskStatus::Unclaimed {
        // Already unclaimed; still clear retry state below.
        task
    } else {
        ctx.store.transition(&tid, TaskStatus::Unclaimed).await?
    };
    let updated = ctx
        .store
        .update(&updated.id, |t| {
            t.spawn_attempts = 0;
            t.blocked = false;
        })
        .await?;

    // Let a running loop drop any queue entries for this task.
    ctx.send_command(ControlCommand::ResetTask { task_id: tid.clone() });
    ctx.publish(OrchestratorEvent::TaskReset {
        task_id: tid,
        reason: ResetReason::UserReset,
    });
    Ok(Json(updated))
}

/// GET /projects/{id}/tasks/{tid}/logs: scrape the live session's pane
/// on demand. Never part of the hot path.
pub(crate) async fn get_task_logs(
    State(state): State<Arc<ApiState>>,
    Path((project, tid)): Path<(String, String)>,
) -> Result<Json<TaskLogsResponse>, ApiError> {
    let ctx = state.project(&project)?;
    let task = ctx
        .store
        .get(&tid)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("task {tid}")))?;
    let Some(session) = task.session else {
        return Err(ApiError::Conflict(format!("task {tid} has no live session")));
    };
    let content = ctx
        .runner
        .capture_log(&session)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(TaskLogsResponse {
        task_id: tid,
        attach_command: ctx.runner.attach_command(&session),
        session,
        content,
    }))
}

/// Suffix the candidate id until it is unique within the project.
fn unique_id(tasks: &[Task], candidate: &str) -> String {
    if !tasks.iter().any(|t| t.id == candidate) {
        return candidate.to_string();
    }
    let mut n = 2;
    loop {
        let next = format!("{candidate}-{n}");
        if !tasks.iter().any(|t| t.id == next) {
            return next;
        }
        n += 1;
    }
}

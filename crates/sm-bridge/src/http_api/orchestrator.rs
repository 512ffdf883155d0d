use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;
use tracing::info;

use sm_core::config::OrchestratorConfig;

use super::state::ApiState;
use super::types::AcceptedResponse;
use crate::api_error::ApiError;
use crate::protocol::ControlCommand;

/// POST /projects/{id}/orchestrator/start: launch the supervising loop.
pub(crate) async fn start_orchestrator(
    State(state): State<Arc<ApiState>>,
    Path(project): Path<String>,
) -> Result<Json<AcceptedResponse>, ApiError> {
    let ctx = state.project(&project)?;
    if ctx.is_running() {
        return Ok(Json(AcceptedResponse::new("orchestrator already running")));
    }
    let Some(launcher) = state.loop_launcher() else {
        return Err(ApiError::Conflict(
            "no orchestrator runtime registered with this control plane".to_string(),
        ));
    };
    launcher(ctx.clone());
    info!(project = %project, "orchestrator start requested");
    Ok(Json(AcceptedResponse::new("orchestrator starting")))
}

/// POST /projects/{id}/orchestrator/stop: graceful stop: agents get the
/// configured grace period, then the loop exits.
pub(crate) async fn stop_orchestrator(
    State(state): State<Arc<ApiState>>,
    Path(project): Path<String>,
) -> Result<Json<AcceptedResponse>, ApiError> {
    let ctx = state.project(&project)?;
    if !ctx.is_running() {
        return Ok(Json(AcceptedResponse::new("orchestrator not running")));
    }
    ctx.send_command(ControlCommand::Stop);
    Ok(Json(AcceptedResponse::new("orchestrator stopping")))
}

/// POST /projects/{id}/orchestrator/acknowledge: clear a merge-queue
/// pause left by the `abort` conflict policy.
pub(crate) async fn acknowledge_merge_failure(
    State(state): State<Arc<ApiState>>,
    Path(project): Path<String>,
) -> Result<Json<AcceptedResponse>, ApiError> {
    let ctx = state.project(&project)?;
    ctx.send_command(ControlCommand::AcknowledgeMergeFailure);
    Ok(Json(AcceptedResponse::new("merge queue acknowledged")))
}

/// GET /projects/{id}/orchestrator/config: the current runtime knobs.
pub(crate) async fn get_config(
    State(state): State<Arc<ApiState>>,
    Path(project): Path<String>,
) -> Result<Json<OrchestratorConfig>, ApiError> {
    let ctx = state.project(&project)?;
    let config = ctx.config.read().await.clone();
    Ok(Json(config))
}

/// PUT /projects/{id}/orchestrator/config: replace the runtime knobs.
///
/// Unknown keys are rejected by deserialization; ranges are validated
/// here. The accepted config is persisted so overrides survive restarts.
pub(crate) async fn put_config(
    State(state): State<Arc<ApiState>>,
    Path(project): Path<String>,
    Json(config): Json<OrchestratorConfig>,
) -> Result<Json<OrchestratorConfig>, ApiError> {
    let ctx = state.project(&project)?;
    config
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    config
        .save_to(&ctx.config_path)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    *ctx.config.write().await = config.clone();
    info!(project = %project, "orchestrator config updated");
    Ok(Json(config))
}

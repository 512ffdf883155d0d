use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use sm_coord::{dispatch, RpcRequest, RpcResponse};
use sm_telemetry::metrics::OrchestratorCounters;

use super::state::ApiState;
use super::types::CoordinationStatsResponse;
use crate::api_error::ApiError;

/// POST /projects/{id}/coordination/rpc: the agent-facing RPC surface.
///
/// Agents running in their sessions call this with a tagged `op` body.
/// Registry-level failures come back as structured `{success: false}`
/// results, never as HTTP errors; only unknown projects and malformed
/// JSON are transport failures.
pub(crate) async fn coordination_rpc(
    State(state): State<Arc<ApiState>>,
    Path(project): Path<String>,
    Json(request): Json<RpcRequest>,
) -> Result<Json<RpcResponse>, ApiError> {
    let ctx = state.project(&project)?;
    OrchestratorCounters::incr(&ctx.counters.rpc_calls);
    Ok(Json(dispatch(&ctx.registry, request)))
}

/// GET /projects/{id}/coordination/stats: aggregate registry and
/// orchestration metrics.
pub(crate) async fn coordination_stats(
    State(state): State<Arc<ApiState>>,
    Path(project): Path<String>,
) -> Result<Json<CoordinationStatsResponse>, ApiError> {
    let ctx = state.project(&project)?;
    Ok(Json(CoordinationStatsResponse {
        registry: ctx.registry.stats(),
        counters: ctx.counters.snapshot(),
        orchestrator_running: ctx.is_running(),
    }))
}

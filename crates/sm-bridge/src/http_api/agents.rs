use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use sm_core::types::AgentRecord;

use super::state::ApiState;
use crate::api_error::ApiError;

/// GET /projects/{id}/agents: live agents from the coordination registry.
pub(crate) async fn list_agents(
    State(state): State<Arc<ApiState>>,
    Path(project): Path<String>,
) -> Result<Json<Vec<AgentRecord>>, ApiError> {
    let ctx = state.project(&project)?;
    Ok(Json(ctx.registry.list_active_agents()))
}

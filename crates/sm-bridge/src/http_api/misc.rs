use axum::{extract::State, Json};
use std::sync::Arc;

use super::state::ApiState;
use crate::protocol::{ProjectStatus, StatusPayload};

/// GET /status: daemon liveness plus a per-project summary.
pub(crate) async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusPayload> {
    // Collected first so no map guard is held across the awaits below.
    let contexts: Vec<_> = state.projects.iter().map(|e| e.value().clone()).collect();
    let mut projects = Vec::new();
    for ctx in contexts {
        projects.push(ProjectStatus {
            id: ctx.id.clone(),
            orchestrator_running: ctx.is_running(),
            tasks: ctx.store.list().await.len(),
            active_agents: ctx.registry.list_active_agents().len(),
        });
    }
    projects.sort_by(|a, b| a.id.cmp(&b.id));

    Json(StatusPayload {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        projects,
        timestamp: chrono::Utc::now(),
    })
}

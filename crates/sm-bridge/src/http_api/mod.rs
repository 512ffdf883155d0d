// ---------------------------------------------------------------------------
// HTTP API module directory
// ---------------------------------------------------------------------------
//
// Domain-split handler modules wired together by the router below. The
// daemon builds the router with `api_router(state)` and serves it with
// axum; everything shares one `Arc<ApiState>`.

mod agents;
mod coordination;
mod misc;
mod orchestrator;
pub mod state;
mod tasks;
pub mod types;
mod websocket;

pub use state::{ApiState, LoopLauncher, ProjectContext};

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Build the full control-plane router.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/status", get(misc::get_status))
        .route("/projects/{id}/tasks", get(tasks::list_tasks))
        .route("/projects/{id}/tasks", post(tasks::create_task))
        .route("/projects/{id}/tasks/{tid}", put(tasks::update_task))
        .route("/projects/{id}/tasks/{tid}", delete(tasks::delete_task))
        .route("/projects/{id}/tasks/{tid}/merge", post(tasks::merge_task))
        .route("/projects/{id}/tasks/{tid}/reset", post(tasks::reset_task))
        .route("/projects/{id}/tasks/{tid}/logs", get(tasks::get_task_logs))
        .route("/projects/{id}/agents", get(agents::list_agents))
        .route(
            "/projects/{id}/orchestrator/start",
            post(orchestrator::start_orchestrator),
        )
        .route(
            "/projects/{id}/orchestrator/stop",
            post(orchestrator::stop_orchestrator),
        )
        .route(
            "/projects/{id}/orchestrator/acknowledge",
            post(orchestrator::acknowledge_merge_failure),
        )
        .route(
            "/projects/{id}/orchestrator/config",
            get(orchestrator::get_config).put(orchestrator::put_config),
        )
        .route(
            "/projects/{id}/coordination/rpc",
            post(coordination::coordination_rpc),
        )
        .route(
            "/projects/{id}/coordination/stats",
            get(coordination::coordination_stats),
        )
        .route(
            "/projects/{id}/coordination/live",
            get(websocket::live_stream),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

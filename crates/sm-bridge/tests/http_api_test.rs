//! Control-plane API tests driven through the router directly.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use sm_bridge::http_api::{api_router, ApiState, ProjectContext};
use sm_coord::CoordinationRegistry;
use sm_core::config::OrchestratorConfig;
use sm_core::store::TaskStore;
use sm_core::types::TaskStatus;
use sm_session::{MuxOutput, MuxRunner, SessionRunner};

struct QuietMux;

impl MuxRunner for QuietMux {
    fn run_mux(&self, _args: &[&str]) -> Result<MuxOutput, String> {
        Ok(MuxOutput::ok(""))
    }
}

async fn test_router() -> (Router, Arc<ApiState>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TaskStore::open(dir.path().join("tasks.md")).await.unwrap());
    let ctx = Arc::new(ProjectContext::new(
        "p1",
        dir.path(),
        store,
        Arc::new(CoordinationRegistry::new()),
        Arc::new(SessionRunner::with_mux("agent", Box::new(QuietMux))),
        OrchestratorConfig::default(),
        dir.path().join("config.toml"),
    ));
    let state = Arc::new(ApiState::new());
    state.register_project(ctx);
    (api_router(state.clone()), state, dir)
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn create_and_list_tasks() {
    let (router, _state, _dir) = test_router().await;

    let (status, task) = send(
        &router,
        "POST",
        "/projects/p1/tasks",
        Some(serde_json::json!({
            "title": "Add login page",
            "description": "Build the login form",
            "priority": 5,
            "exclusive_files": ["src/login.rs"]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["id"], "add-login-page");
    assert_eq!(task["branch"], "add-login-page");
    assert_eq!(task["status"], "UNCLAIMED");

    let (status, list) = send(&router, "GET", "/projects/p1/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, filtered) =
        send(&router, "GET", "/projects/p1/tasks?status=MERGED", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(filtered.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_branch_is_rejected() {
    let (router, _state, _dir) = test_router().await;
    let body = serde_json::json!({"title": "One", "branch": "same"});
    let (status, _) = send(&router, "POST", "/projects/p1/tasks", Some(body)).await;
    assert_eq!(status, StatusCode::OK);

    let body = serde_json::json!({"title": "Two", "branch": "same"});
    let (status, err) = send(&router, "POST", "/projects/p1/tasks", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"]["kind"], "bad_request");
}

#[tokio::test]
async fn invalid_branch_syntax_is_rejected() {
    let (router, _state, _dir) = test_router().await;
    let body = serde_json::json!({"title": "Bad", "branch": "a/b"});
    let (status, _) = send(&router, "POST", "/projects/p1/tasks", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_transitions_are_validated() {
    let (router, _state, _dir) = test_router().await;
    send(
        &router,
        "POST",
        "/projects/p1/tasks",
        Some(serde_json::json!({"title": "T"})),
    )
    .await;

    // UNCLAIMED -> MERGED is not a legal jump.
    let (status, err) = send(
        &router,
        "PUT",
        "/projects/p1/tasks/t",
        Some(serde_json::json!({"status": "MERGED"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"]["message"]
        .as_str()
        .unwrap()
        .contains("transition"));

    // UNCLAIMED -> UP_NEXT is fine.
    let (status, task) = send(
        &router,
        "PUT",
        "/projects/p1/tasks/t",
        Some(serde_json::json!({"status": "UP_NEXT", "priority": 9})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "UP_NEXT");
    assert_eq!(task["priority"], 9);
}

#[tokio::test]
async fn delete_in_progress_requires_force() {
    let (router, state, _dir) = test_router().await;
    send(
        &router,
        "POST",
        "/projects/p1/tasks",
        Some(serde_json::json!({"title": "busy"})),
    )
    .await;

    // Drive the task to IN_PROGRESS through the store directly.
    let ctx = state.project("p1").unwrap();
    ctx.store.transition("busy", TaskStatus::UpNext).await.unwrap();
    ctx.store.claim("busy", "busy-session").await.unwrap();

    let (status, err) = send(&router, "DELETE", "/projects/p1/tasks/busy", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"]["kind"], "conflict");

    let (status, _) = send(&router, "DELETE", "/projects/p1/tasks/busy?force=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(ctx.store.get("busy").await.is_none());
}

#[tokio::test]
async fn merge_endpoint_requires_completed_and_running_loop() {
    let (router, _state, _dir) = test_router().await;
    send(
        &router,
        "POST",
        "/projects/p1/tasks",
        Some(serde_json::json!({"title": "t"})),
    )
    .await;

    let (status, _) = send(&router, "POST", "/projects/p1/tasks/t/merge", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn reset_clears_retry_state() {
    let (router, state, _dir) = test_router().await;
    send(
        &router,
        "POST",
        "/projects/p1/tasks",
        Some(serde_json::json!({"title": "t"})),
    )
    .await;
    let ctx = state.project("p1").unwrap();
    ctx.store
        .update("t", |t| {
            t.spawn_attempts = 3;
            t.blocked = true;
        })
        .await
        .unwrap();

    let (status, task) = send(&router, "POST", "/projects/p1/tasks/t/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "UNCLAIMED");
    assert_eq!(task["spawn_attempts"], 0);
    assert_eq!(task["blocked"], false);
}

#[tokio::test]
async fn config_round_trip_and_validation() {
    let (router, _state, dir) = test_router().await;

    let (status, config) = send(&router, "GET", "/projects/p1/orchestrator/config", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["max_concurrent_agents"], 4);

    let mut updated = config.clone();
    updated["max_concurrent_agents"] = serde_json::json!(8);
    let (status, config) = send(
        &router,
        "PUT",
        "/projects/p1/orchestrator/config",
        Some(updated.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["max_concurrent_agents"], 8);
    // Overrides persisted for the next restart.
    assert!(dir.path().join("config.toml").exists());

    // Out of range.
    updated["max_concurrent_agents"] = serde_json::json!(50);
    let (status, _) = send(
        &router,
        "PUT",
        "/projects/p1/orchestrator/config",
        Some(updated.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Unknown keys are rejected on write.
    updated["max_concurrent_agents"] = serde_json::json!(8);
    updated["mystery_knob"] = serde_json::json!(true);
    let (status, _) = send(
        &router,
        "PUT",
        "/projects/p1/orchestrator/config",
        Some(updated),
    )
    .await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn start_without_runtime_is_a_conflict() {
    let (router, _state, _dir) = test_router().await;
    let (status, err) = send(&router, "POST", "/projects/p1/orchestrator/start", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(err["error"]["message"]
        .as_str()
        .unwrap()
        .contains("runtime"));
}

#[tokio::test]
async fn coordination_rpc_lock_contention_over_http() {
    let (router, _state, _dir) = test_router().await;

    for session in ["s1", "s2"] {
        let (status, resp) = send(
            &router,
            "POST",
            "/projects/p1/coordination/rpc",
            Some(serde_json::json!({
                "op": "register_agent",
                "session_name": session,
                "task_id": "t",
                "branch": "b"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["success"], true);
    }

    let lock = serde_json::json!({
        "op": "announce_file_change",
        "session_name": "s1",
        "path": "config.ts",
        "change_type": "modify"
    });
    let (_, resp) = send(&router, "POST", "/projects/p1/coordination/rpc", Some(lock)).await;
    assert_eq!(resp["success"], true);

    let contested = serde_json::json!({
        "op": "announce_file_change",
        "session_name": "s2",
        "path": "config.ts",
        "change_type": "modify"
    });
    let (status, resp) = send(
        &router,
        "POST",
        "/projects/p1/coordination/rpc",
        Some(contested.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "conflicts are payload, not HTTP errors");
    assert_eq!(resp["success"], false);
    assert_eq!(resp["kind"], "conflict");
    assert_eq!(resp["holder"], "s1");

    let release = serde_json::json!({
        "op": "release_file_lock",
        "session_name": "s1",
        "path": "config.ts"
    });
    send(&router, "POST", "/projects/p1/coordination/rpc", Some(release)).await;
    let (_, resp) = send(&router, "POST", "/projects/p1/coordination/rpc", Some(contested)).await;
    assert_eq!(resp["success"], true);
}

#[tokio::test]
async fn stats_and_status_endpoints_respond() {
    let (router, _state, _dir) = test_router().await;

    let (status, stats) = send(&router, "GET", "/projects/p1/coordination/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["registry"]["active_agents"], 0);
    assert_eq!(stats["orchestrator_running"], false);

    let (status, body) = send(&router, "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["projects"][0]["id"], "p1");
}

#[tokio::test]
async fn unknown_project_is_not_found() {
    let (router, _state, _dir) = test_router().await;
    let (status, err) = send(&router, "GET", "/projects/ghost/tasks", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"]["kind"], "not_found");
}

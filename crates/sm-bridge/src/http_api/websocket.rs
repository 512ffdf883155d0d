use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use sm_core::types::{CoordinationEvent, CoordinationEventKind};

use super::state::{ApiState, ProjectContext};
use crate::api_error::ApiError;
use crate::protocol::OrchestratorEvent;

/// WebSocket GET /projects/{id}/coordination/live: the live event stream.
///
/// On connect the client first receives a replay of the current snapshot
/// (tasks, live agents, held locks, registered interfaces), then the
/// ongoing event-bus feed. A slow client is disconnected by the bus
/// rather than allowed to stall publishers.
pub(crate) async fn live_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = state.project(&project)?;
    Ok(ws.on_upgrade(move |socket| handle_live(socket, ctx)))
}

async fn handle_live(socket: WebSocket, ctx: Arc<ProjectContext>) {
    let snapshot = snapshot_events(&ctx).await;
    let rx = ctx.bus.subscribe_with_replay(snapshot);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(30));
    heartbeat.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            result = rx.recv_async() => {
                match result {
                    Ok(event) => {
                        let json = serde_json::to_string(&*event).unwrap_or_default();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            _ = heartbeat.tick() => {
                let ping = serde_json::json!({
                    "type": "ping",
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                });
                if ws_tx.send(Message::Text(ping.to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // pongs and client chatter are ignored
                }
            }
        }
    }
}

/// Current state rendered as the event sequence a fresh observer needs.
async fn snapshot_events(ctx: &ProjectContext) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();

    for task in ctx.store.list().await {
        events.push(OrchestratorEvent::TaskUpdated(task));
    }
    for agent in ctx.registry.list_active_agents() {
        events.push(OrchestratorEvent::Coordination(
            CoordinationEvent::new(CoordinationEventKind::AgentRegistered, &agent.session_name)
                .with_payload(serde_json::json!({
                    "task_id": agent.task_id,
                    "branch": agent.branch,
                })),
        ));
    }
    for lock in ctx.registry.list_file_locks() {
        events.push(OrchestratorEvent::Coordination(
            CoordinationEvent::new(CoordinationEventKind::FileLocked, &lock.session_name)
                .with_payload(serde_json::json!({"path": lock.path})),
        ));
    }
    for iface in ctx.registry.list_interfaces() {
        events.push(OrchestratorEvent::Coordination(
            CoordinationEvent::new(
                CoordinationEventKind::InterfaceRegistered,
                &iface.owner_session,
            )
            .with_payload(serde_json::json!({"name": iface.name})),
        ));
    }

    events
}

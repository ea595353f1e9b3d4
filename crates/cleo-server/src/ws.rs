//! WebSocket push gateway on `HTTP_PORT + 1`.
//!
//! Authenticates with `?token=` on connect (same token as HTTP), pushes
//! the full snapshot immediately, then diffs at ≤ 1 Hz when the snapshot
//! hash changes. Client frames carry an `action` field: `ping`,
//! `subscribe` (accepted, filtering reserved), and `submit_task`. A send
//! failure ends the connection's loop, which prunes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};

use crate::snapshot::{build_snapshot, snapshot_hash};
use crate::state::AppState;

const PUSH_INTERVAL: Duration = Duration::from_secs(1);

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .route("/ws", get(upgrade))
        .with_state(state)
}

/// Serve the WebSocket gateway. Runs until the process exits.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let port = state.port + 1;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "WebSocket gateway listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match query.get("token") {
        Some(token) if *token == state.token => {
            ws.on_upgrade(move |socket| handle_socket(socket, state))
                .into_response()
        }
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    // Full snapshot on accept.
    let snapshot = build_snapshot(&state);
    let mut last_hash = snapshot_hash(&snapshot);
    if socket
        .send(Message::Text(
            json!({"event": "state", "data": snapshot}).to_string().into(),
        ))
        .await
        .is_err()
    {
        return;
    }

    let mut ticker = tokio::time::interval(PUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = build_snapshot(&state);
                let hash = snapshot_hash(&snapshot);
                if hash != last_hash {
                    last_hash = hash;
                    let frame = json!({"event": "state", "data": snapshot}).to_string();
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        // Dead connection; drop it.
                        return;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(raw))) => {
                        let reply = handle_command(&state, raw.as_str()).await;
                        if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket receive error");
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_command(state: &Arc<AppState>, raw: &str) -> Value {
    let Ok(frame) = serde_json::from_str::<Value>(raw) else {
        return json!({"event": "error", "message": "invalid JSON frame"});
    };
    match frame.get("action").and_then(|v| v.as_str()) {
        Some("ping") => json!({"event": "pong"}),
        Some("subscribe") => {
            // Channel filtering is reserved; acknowledge the selector.
            json!({"event": "subscribed", "channel": frame.get("channel").cloned().unwrap_or(Value::Null)})
        }
        Some("submit_task") => {
            let Some(description) = frame.get("description").and_then(|v| v.as_str()) else {
                return json!({"event": "error", "message": "submit_task needs a description"});
            };
            let orch = state.orchestrator.lock().await;
            match orch.submit(description) {
                Ok(task_id) => json!({"event": "task_submitted", "task_id": task_id}),
                Err(e) => json!({"event": "error", "message": e.to_string()}),
            }
        }
        other => json!({"event": "error", "message": format!("unknown action: {other:?}")}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cleo::config::CleoConfig;
    use cleo::workdir::Workdir;

    fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
        AppState::new(
            Workdir::new(dir.path()),
            CleoConfig::default(),
            "secret-token".to_string(),
            19789,
        )
    }

    #[tokio::test]
    async fn test_command_frames() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let reply = handle_command(&state, r#"{"action": "ping"}"#).await;
        assert_eq!(reply["event"], "pong");

        let reply = handle_command(&state, r#"{"action": "subscribe", "channel": "tasks"}"#).await;
        assert_eq!(reply["event"], "subscribed");
        assert_eq!(reply["channel"], "tasks");

        let reply =
            handle_command(&state, r#"{"action": "submit_task", "description": "do it"}"#).await;
        assert_eq!(reply["event"], "task_submitted");
        let task_id = reply["task_id"].as_str().unwrap();
        assert!(state.board.get(task_id).is_some());

        let reply = handle_command(&state, "not json").await;
        assert_eq!(reply["event"], "error");
        let reply = handle_command(&state, r#"{"action": "warp"}"#).await;
        assert_eq!(reply["event"], "error");
    }
}

//! A2A endpoints.
//!
//! - `GET  /.well-known/agent.json` — Agent Card discovery (public).
//! - `POST /a2a`                    — JSON-RPC 2.0; `?sync=true` blocks
//!   `message/send` until the pipeline settles (or `timeout` seconds).
//! - `GET  /a2a/stream/{id}`        — SSE status/artifact/done stream.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde_json::{json, Value};

use cleo_a2a::jsonrpc::methods;
use cleo_a2a::types::A2AState;

use crate::state::AppState;

const STREAM_POLL: Duration = Duration::from_secs(1);
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/.well-known/agent.json", get(agent_card))
        .route("/a2a", post(rpc))
        .route("/a2a/stream/{id}", get(stream))
        .with_state(state)
}

async fn agent_card(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(state.a2a.agent_card()).unwrap_or_default())
}

async fn rpc(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let sync = query
        .get("sync")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let method = body.get("method").and_then(|v| v.as_str()).unwrap_or("");

    if sync && method == methods::SEND_MESSAGE {
        let timeout = query
            .get("timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(300.0);
        let rpc_id = body.get("id").cloned().unwrap_or(Value::Null);
        let params = body.get("params").cloned().unwrap_or_else(|| json!({}));
        return Json(
            state
                .a2a
                .handle_message_send_sync(rpc_id, &params, timeout)
                .await,
        );
    }

    Json(state.a2a.handle_rpc(&body))
}

/// Poll-based relay of one task's lifecycle as SSE.
async fn stream(
    State(state): State<Arc<AppState>>,
    Path(a2a_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    struct StreamState {
        app: Arc<AppState>,
        a2a_id: String,
        last_state: String,
        deadline: Instant,
        pending: Vec<Event>,
        done: bool,
    }

    let initial = StreamState {
        app: state,
        a2a_id,
        last_state: String::new(),
        deadline: Instant::now() + STREAM_TIMEOUT,
        pending: Vec::new(),
        done: false,
    };

    let stream = futures::stream::unfold(initial, |mut s| async move {
        loop {
            if let Some(event) = s.pending.pop() {
                return Some((Ok(event), s));
            }
            if s.done {
                return None;
            }
            if Instant::now() >= s.deadline {
                s.done = true;
                let event = Event::default()
                    .event("error")
                    .data(json!({"message": "Stream timeout"}).to_string());
                return Some((Ok(event), s));
            }

            let task = s.app.a2a.bridge().get_task_status(&s.a2a_id);
            let current = task.status.state.as_str().to_string();
            if current != s.last_state {
                s.last_state = current.clone();
                // Queue in reverse so pop() preserves order.
                if task.status.state.is_terminal() {
                    s.done = true;
                    s.pending.push(
                        Event::default()
                            .event("done")
                            .data(json!({"state": current}).to_string()),
                    );
                }
                if task.status.state == A2AState::Completed {
                    for artifact in task.artifacts.iter().rev() {
                        s.pending.push(
                            Event::default().event("artifact").data(
                                serde_json::to_value(artifact).unwrap_or_default().to_string(),
                            ),
                        );
                    }
                }
                s.pending.push(
                    Event::default().event("status").data(
                        serde_json::to_value(&task.status)
                            .unwrap_or_default()
                            .to_string(),
                    ),
                );
                continue;
            }

            tokio::time::sleep(STREAM_POLL).await;
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

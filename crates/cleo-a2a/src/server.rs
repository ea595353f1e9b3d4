//! Inbound A2A server: JSON-RPC 2.0 dispatch over the bridge.
//!
//! The gateway mounts this at `POST /a2a` and serves the Agent Card at
//! `/.well-known/agent.json`. `message/send` submits and returns
//! immediately; the synchronous variant waits for the pipeline through
//! the bridge. A per-task SSE stream relays state changes, artifacts,
//! and a terminal `done` event.

use futures::Stream;
use serde_json::{json, Value};

use cleo::workdir::Workdir;

use crate::bridge::A2ABridge;
use crate::error::A2AError;
use crate::jsonrpc::methods;
use crate::types::AgentCard;

pub struct A2AServer {
    enabled: bool,
    bridge: A2ABridge,
    agent_card: AgentCard,
}

impl A2AServer {
    pub fn new(workdir: Workdir, enabled: bool, public_url: impl Into<String>) -> Self {
        let bridge = A2ABridge::new(workdir);
        let agent_card = AgentCard::for_url(public_url);
        tracing::info!(enabled, "A2A server initialized");
        Self {
            enabled,
            bridge,
            agent_card,
        }
    }

    pub fn bridge(&self) -> &A2ABridge {
        &self.bridge
    }

    pub fn agent_card(&self) -> &AgentCard {
        &self.agent_card
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Route a JSON-RPC 2.0 request body to its handler. Always returns a
    /// response envelope, never errors out of band.
    pub fn handle_rpc(&self, body: &Value) -> Value {
        let rpc_id = body.get("id").cloned().unwrap_or(Value::Null);

        if !self.enabled {
            return error_response(rpc_id, &A2AError::server_error("A2A server is disabled"));
        }
        if body.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
            return error_response(
                rpc_id,
                &A2AError::invalid_request("jsonrpc must be '2.0'"),
            );
        }
        let Some(method) = body.get("method").and_then(|v| v.as_str()).filter(|m| !m.is_empty())
        else {
            return error_response(rpc_id, &A2AError::invalid_request("method is required"));
        };
        let params = body.get("params").cloned().unwrap_or_else(|| json!({}));

        tracing::info!(method, "A2A RPC");
        match method {
            methods::SEND_MESSAGE => self.handle_message_send(rpc_id, &params),
            methods::GET_TASK => self.handle_tasks_get(rpc_id, &params),
            methods::CANCEL_TASK => self.handle_tasks_cancel(rpc_id, &params),
            other => error_response(rpc_id, &A2AError::method_not_found(other)),
        }
    }

    /// Async default: create the task and return it in `submitted` state.
    /// Callers poll `tasks/get` (or open the SSE stream) for progress.
    fn handle_message_send(&self, rpc_id: Value, params: &Value) -> Value {
        let context_id = params
            .get("message")
            .and_then(|m| m.get("contextId"))
            .and_then(|v| v.as_str())
            .unwrap_or("");

        match self.bridge.inbound_message(params, context_id) {
            Ok(task) => {
                tracing::info!(a2a_id = %task.id, "message/send accepted");
                success_response(rpc_id, &task)
            }
            Err(e) => error_response(rpc_id, &A2AError::server_error(e)),
        }
    }

    /// Synchronous variant: create the task, then block (async) until the
    /// pipeline settles or the timeout passes.
    pub async fn handle_message_send_sync(
        &self,
        rpc_id: Value,
        params: &Value,
        timeout_secs: f64,
    ) -> Value {
        if !self.enabled {
            return error_response(rpc_id, &A2AError::server_error("A2A server is disabled"));
        }
        let context_id = params
            .get("message")
            .and_then(|m| m.get("contextId"))
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let task = match self.bridge.inbound_message(params, context_id) {
            Ok(task) => task,
            Err(e) => return error_response(rpc_id, &A2AError::server_error(e)),
        };
        tracing::info!(a2a_id = %task.id, "message/send (sync): waiting");
        let done = self.bridge.wait_for_completion(&task.id, timeout_secs).await;
        success_response(rpc_id, &done)
    }

    fn handle_tasks_get(&self, rpc_id: Value, params: &Value) -> Value {
        let Some(id) = params.get("id").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
            return error_response(rpc_id, &A2AError::invalid_params("missing required param: id"));
        };
        success_response(rpc_id, &self.bridge.get_task_status(id))
    }

    fn handle_tasks_cancel(&self, rpc_id: Value, params: &Value) -> Value {
        let Some(id) = params.get("id").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
            return error_response(rpc_id, &A2AError::invalid_params("missing required param: id"));
        };
        success_response(rpc_id, &self.bridge.cancel_task(id))
    }

    // ── SSE ─────────────────────────────────────────────────────────────

    /// Event stream for one task: `status` on every state change,
    /// `artifact` per artifact on completion, `done` on terminal,
    /// `error` on timeout. Items are pre-formatted SSE frames.
    pub fn sse_events(
        &self,
        a2a_id: String,
        poll_interval_secs: f64,
        timeout_secs: f64,
    ) -> impl Stream<Item = String> + '_ {
        async_stream::stream! {
            let deadline = std::time::Instant::now()
                + std::time::Duration::from_secs_f64(timeout_secs);
            let mut last_state = String::new();

            while std::time::Instant::now() < deadline {
                let task = self.bridge.get_task_status(&a2a_id);
                let state = task.status.state.as_str().to_string();

                if state != last_state {
                    yield sse_event("status", &serde_json::to_value(&task.status).unwrap_or_default());
                    last_state = state.clone();

                    if task.status.state == crate::types::A2AState::Completed {
                        for artifact in &task.artifacts {
                            yield sse_event(
                                "artifact",
                                &serde_json::to_value(artifact).unwrap_or_default(),
                            );
                        }
                    }
                    if task.status.state.is_terminal() {
                        yield sse_event("done", &json!({"state": state}));
                        return;
                    }
                }

                tokio::time::sleep(std::time::Duration::from_secs_f64(poll_interval_secs)).await;
            }

            yield sse_event("error", &json!({"message": "Stream timeout"}));
        }
    }
}

fn success_response<T: serde::Serialize>(rpc_id: Value, result: &T) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": rpc_id,
        "result": serde_json::to_value(result).unwrap_or_default(),
    })
}

fn error_response(rpc_id: Value, error: &A2AError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": rpc_id,
        "error": {
            "code": error.code(),
            "message": error.to_string(),
        },
    })
}

fn sse_event(event: &str, data: &Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

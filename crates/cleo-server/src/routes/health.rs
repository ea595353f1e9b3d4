//! Public endpoints: dashboard shell and the health probe.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/health", get(health))
        .with_state(state)
}

async fn dashboard() -> Html<&'static str> {
    // The rich dashboard ships separately; the gateway serves a shell so
    // `GET /` always answers.
    Html(
        "<!doctype html><html><head><title>Cleo</title></head>\
         <body><h1>Cleo gateway</h1>\
         <p>See <code>/health</code> and <code>/v1/status</code>.</p>\
         </body></html>",
    )
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "agents": state.config.agents.len(),
        "uptime_seconds": state.uptime_seconds(),
        "port": state.port,
    }))
}

//! Thin file-backed memory endpoints.
//!
//! The full memory backend is a collaborator; the gateway only exposes
//! what's on disk under `memory/` so dashboards work against the mock
//! backend too.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/memory/status", get(status))
        .route("/v1/memory/episodes/{aid}", get(episodes))
        .route("/v1/memory/cases/{aid}", get(cases))
        .route("/v1/memory/daily/{aid}", get(daily))
        .route("/v1/memory/kb/notes", get(kb_notes))
        .route("/v1/memory/kb/moc", get(kb_moc))
        .route("/v1/memory/kb/insights", get(kb_insights))
        .with_state(state)
}

fn read_jsonl(path: &std::path::Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .map(|raw| {
            raw.lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect()
        })
        .unwrap_or_default()
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let episodes = read_jsonl(&state.workdir.join("memory/episodes.jsonl")).len();
    let notes = std::fs::read_dir(state.workdir.join("memory/kb/notes"))
        .map(|iter| iter.count())
        .unwrap_or(0);
    Json(json!({
        "backend": state.config.memory.backend,
        "episodes": episodes,
        "kb_notes": notes,
    }))
}

async fn episodes(
    State(state): State<Arc<AppState>>,
    Path(aid): Path<String>,
) -> Json<Value> {
    let entries: Vec<Value> = read_jsonl(&state.workdir.join("memory/episodes.jsonl"))
        .into_iter()
        .filter(|e| e.get("agent_id").and_then(|v| v.as_str()) == Some(aid.as_str()))
        .collect();
    Json(json!({"agent_id": aid, "episodes": entries}))
}

async fn cases(state: State<Arc<AppState>>, aid: Path<String>) -> Json<Value> {
    // Cases and episodes share the mock backend's store.
    episodes(state, aid).await
}

async fn daily(
    State(state): State<Arc<AppState>>,
    Path(aid): Path<String>,
) -> Json<Value> {
    let content = std::fs::read_to_string(state.workdir.join(&format!("memory/daily_{aid}.md")))
        .unwrap_or_default();
    Json(json!({"agent_id": aid, "content": content}))
}

async fn kb_notes(State(state): State<Arc<AppState>>) -> Json<Value> {
    let notes: Vec<String> = std::fs::read_dir(state.workdir.join("memory/kb/notes"))
        .map(|iter| {
            iter.flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    Json(json!({"notes": notes}))
}

async fn kb_moc(State(state): State<Arc<AppState>>) -> Json<Value> {
    let content =
        std::fs::read_to_string(state.workdir.join("memory/kb/moc.md")).unwrap_or_default();
    Json(json!({"content": content}))
}

async fn kb_insights(State(state): State<Arc<AppState>>) -> Json<Value> {
    let content =
        std::fs::read_to_string(state.workdir.join("memory/kb/insights.md")).unwrap_or_default();
    Json(json!({"content": content}))
}

//! Task lifecycle endpoints over the board.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use cleo::board::Task;
use cleo::live_status::failure_hint_from_flags;
use cleo::board::TaskStatus;

use crate::state::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/task", post(submit_task))
        .route("/v1/task/{id}", get(get_task))
        .route("/v1/status", get(status))
        .route("/v1/task/{id}/cancel", post(cancel_task))
        .route("/v1/task/{id}/pause", post(pause_task))
        .route("/v1/task/{id}/resume", post(resume_task))
        .route("/v1/task/{id}/retry", post(retry_task))
        .route("/v1/tasks/cancel_all", post(cancel_all))
        .with_state(state)
}

#[derive(Deserialize)]
struct SubmitBody {
    description: String,
}

async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let orch = state.orchestrator.lock().await;
    match orch.submit(&body.description) {
        Ok(task_id) => Ok(Json(json!({"task_id": task_id}))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )),
    }
}

fn task_view(task: &Task) -> Value {
    let mut view = serde_json::to_value(task).unwrap_or_default();
    if task.status == TaskStatus::Failed {
        if let Some(hint) = failure_hint_from_flags(&task.evolution_flags) {
            view["failure_hint"] = json!(hint);
        }
    }
    view
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.board.get(&id) {
        Some(task) => Ok(Json(task_view(&task))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let tasks: Vec<Value> = state.board.all().iter().map(task_view).collect();
    Json(json!({"tasks": tasks}))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Value> {
    let ok = state.board.cancel(&id).unwrap_or(false);
    Json(json!({"ok": ok}))
}

async fn pause_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Value> {
    let ok = state.board.pause(&id).unwrap_or(false);
    Json(json!({"ok": ok}))
}

async fn resume_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Value> {
    let ok = state.board.resume(&id).unwrap_or(false);
    Json(json!({"ok": ok}))
}

async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Value> {
    let ok = state.board.retry(&id).unwrap_or(false);
    Json(json!({"ok": ok}))
}

async fn cancel_all(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cancelled = state.board.cancel_all().unwrap_or(0);
    Json(json!({"cancelled": cancelled}))
}

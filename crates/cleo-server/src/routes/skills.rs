//! Skill file CRUD.
//!
//! Names are validated against `^[A-Za-z0-9_-]+$` before touching the
//! filesystem, which blocks traversal through the path parameters.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use cleo::skills;

use crate::state::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/skills", get(list))
        .route("/v1/skills/team", get(get_team).put(put_team))
        .route("/v1/skills/team/regenerate", post(regenerate_team))
        .route(
            "/v1/skills/agents/{aid}/{name}",
            get(get_agent_skill).put(put_agent_skill).delete(delete_agent_skill),
        )
        .route(
            "/v1/skills/{name}",
            get(get_skill).put(put_skill).delete(delete_skill),
        )
        .with_state(state)
}

#[derive(Deserialize)]
struct SkillBody {
    content: String,
}

type ApiError = (StatusCode, Json<Value>);

fn bad_name() -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "invalid skill name"})),
    )
}

fn not_found() -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})))
}

fn io_error(e: std::io::Error) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}

async fn list(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"skills": skills::list_skills(&state.workdir)}))
}

async fn get_team(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"content": skills::load_team_skills(&state.workdir)}))
}

async fn put_team(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SkillBody>,
) -> Result<Json<Value>, ApiError> {
    let path = skills::team_skill_path(&state.workdir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    std::fs::write(&path, &body.content).map_err(io_error)?;
    Ok(Json(json!({"ok": true})))
}

/// Rebuild `_team.md` from the configured roster.
async fn regenerate_team(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let mut lines = vec![
        "# Team".to_string(),
        String::new(),
        "Coordinate through the task board; keep results self-contained.".to_string(),
        String::new(),
        "## Members".to_string(),
        String::new(),
    ];
    for agent in &state.config.agents {
        lines.push(format!("- **{}** — {} ({})", agent.id, agent.role, agent.model));
    }
    let content = lines.join("\n");

    let path = skills::team_skill_path(&state.workdir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    std::fs::write(&path, &content).map_err(io_error)?;
    Ok(Json(json!({"ok": true, "content": content})))
}

async fn get_skill(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let path = skills::skill_path(&state.workdir, &name).ok_or_else(bad_name)?;
    let content = std::fs::read_to_string(&path).map_err(|_| not_found())?;
    Ok(Json(json!({"name": name, "content": content})))
}

async fn put_skill(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<SkillBody>,
) -> Result<Json<Value>, ApiError> {
    let path = skills::skill_path(&state.workdir, &name).ok_or_else(bad_name)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    std::fs::write(&path, &body.content).map_err(io_error)?;
    Ok(Json(json!({"ok": true})))
}

async fn delete_skill(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let path = skills::skill_path(&state.workdir, &name).ok_or_else(bad_name)?;
    std::fs::remove_file(&path).map_err(|_| not_found())?;
    Ok(Json(json!({"ok": true})))
}

async fn get_agent_skill(
    State(state): State<Arc<AppState>>,
    Path((aid, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let path = skills::agent_skill_path(&state.workdir, &aid, &name).ok_or_else(bad_name)?;
    let content = std::fs::read_to_string(&path).map_err(|_| not_found())?;
    Ok(Json(json!({"agent_id": aid, "name": name, "content": content})))
}

async fn put_agent_skill(
    State(state): State<Arc<AppState>>,
    Path((aid, name)): Path<(String, String)>,
    Json(body): Json<SkillBody>,
) -> Result<Json<Value>, ApiError> {
    let path = skills::agent_skill_path(&state.workdir, &aid, &name).ok_or_else(bad_name)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    std::fs::write(&path, &body.content).map_err(io_error)?;
    Ok(Json(json!({"ok": true})))
}

async fn delete_agent_skill(
    State(state): State<Arc<AppState>>,
    Path((aid, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let path = skills::agent_skill_path(&state.workdir, &aid, &name).ok_or_else(bad_name)?;
    std::fs::remove_file(&path).map_err(|_| not_found())?;
    Ok(Json(json!({"ok": true})))
}

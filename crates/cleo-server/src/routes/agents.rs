//! Agent configuration updates.
//!
//! `PUT /v1/agents/{id}` patches allow-listed fields into
//! `config/agents.yaml`; `api_key`/`base_url` values are never stored in
//! the YAML — they are written to `.env` as `<AGENT_ID>_API_KEY` /
//! `<AGENT_ID>_BASE_URL` and the config gains the matching `*_env`
//! references. Changes apply to workers at their next spawn.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::put;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

/// Fields a caller may update.
const ALLOWED_FIELDS: &[&str] = &[
    "model",
    "role",
    "skills",
    "fallback_models",
    "autonomy_level",
    "provider",
    "api_key",
    "base_url",
];

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/agents/{id}", put(update_agent))
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

async fn update_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let Some(updates) = body.as_object() else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "body must be a JSON object"})),
        ));
    };
    if let Some(bad) = updates.keys().find(|k| !ALLOWED_FIELDS.contains(&k.as_str())) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("field not allowed: {bad}")})),
        ));
    }

    let config_path = state.workdir.agents_config();
    let raw = std::fs::read_to_string(&config_path).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("config read failed: {e}")})),
        )
    })?;
    let mut doc: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("config parse failed: {e}")})),
        )
    })?;

    let Some(agent) = find_agent_mut(&mut doc, &agent_id) else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown agent: {agent_id}")})),
        ));
    };

    let env_prefix = agent_id.to_uppercase().replace('-', "_");
    let mut env_writes: Vec<(String, String)> = Vec::new();

    for (key, value) in updates {
        match key.as_str() {
            // Secrets route to .env; the YAML only references the var.
            "api_key" => {
                if let Some(secret) = value.as_str() {
                    let var = format!("{env_prefix}_API_KEY");
                    env_writes.push((var.clone(), secret.to_string()));
                    set_llm_field(agent, "api_key_env", &var);
                }
            }
            "base_url" => {
                if let Some(url) = value.as_str() {
                    let var = format!("{env_prefix}_BASE_URL");
                    env_writes.push((var.clone(), url.to_string()));
                    set_llm_field(agent, "base_url_env", &var);
                }
            }
            "provider" => {
                if let Some(provider) = value.as_str() {
                    set_llm_field(agent, "provider", provider);
                }
            }
            other => {
                if let Ok(yaml_value) = serde_yaml::to_value(value) {
                    if let serde_yaml::Value::Mapping(map) = agent {
                        map.insert(serde_yaml::Value::String(other.to_string()), yaml_value);
                    }
                }
            }
        }
    }

    let rendered = serde_yaml::to_string(&doc).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("config render failed: {e}")})),
        )
    })?;
    std::fs::write(&config_path, rendered).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("config write failed: {e}")})),
        )
    })?;

    for (var, value) in &env_writes {
        update_env_file(&state.workdir.join(".env"), var, value).map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!(".env write failed: {e}")})),
            )
        })?;
        std::env::set_var(var, value);
    }

    Ok(Json(json!({
        "ok": true,
        "agent_id": agent_id,
        "env_vars_written": env_writes.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
    })))
}

fn find_agent_mut<'a>(
    doc: &'a mut serde_yaml::Value,
    agent_id: &str,
) -> Option<&'a mut serde_yaml::Value> {
    doc.get_mut("agents")?
        .as_sequence_mut()?
        .iter_mut()
        .find(|a| a.get("id").and_then(|v| v.as_str()) == Some(agent_id))
}

fn set_llm_field(agent: &mut serde_yaml::Value, field: &str, value: &str) {
    let serde_yaml::Value::Mapping(map) = agent else {
        return;
    };
    let llm_key = serde_yaml::Value::String("llm".to_string());
    let llm = map
        .entry(llm_key)
        .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
    if let serde_yaml::Value::Mapping(llm_map) = llm {
        llm_map.insert(
            serde_yaml::Value::String(field.to_string()),
            serde_yaml::Value::String(value.to_string()),
        );
    }
}

/// Upsert `KEY=value` in a dotenv file, preserving unrelated lines.
fn update_env_file(path: &std::path::Path, key: &str, value: &str) -> std::io::Result<()> {
    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let mut lines: Vec<String> = existing.lines().map(|l| l.to_string()).collect();
    let prefix = format!("{key}=");
    match lines.iter_mut().find(|l| l.starts_with(&prefix)) {
        Some(line) => *line = format!("{key}={value}"),
        None => lines.push(format!("{key}={value}")),
    }
    std::fs::write(path, lines.join("\n") + "\n")
}

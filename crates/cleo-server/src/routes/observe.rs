//! Observability endpoints: scores, agents, usage, config, doctor,
//! heartbeats. Reads are lock-free snapshots that accept racy state.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Map, Value};

use cleo::doctor;
use cleo::heartbeat::all_heartbeats;

use crate::state::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/scores", get(scores))
        .route("/v1/agents", get(agents))
        .route("/v1/usage", get(usage))
        .route("/v1/usage/recent", get(usage_recent))
        .route("/v1/config", get(config))
        .route("/v1/doctor", get(doctor_report))
        .route("/v1/heartbeat", get(heartbeats))
        .with_state(state)
}

async fn scores(State(state): State<Arc<AppState>>) -> Json<Value> {
    let entries: Vec<Value> = state
        .board
        .all()
        .into_iter()
        .filter(|t| !t.review_scores.is_empty() || t.critique.is_some())
        .map(|t| {
            json!({
                "task_id": t.task_id,
                "agent_id": t.agent_id,
                "avg_review_score": t.avg_review_score(),
                "review_scores": t.review_scores,
                "critique": t.critique,
            })
        })
        .collect();
    Json(json!({"scores": entries}))
}

async fn agents(State(state): State<Arc<AppState>>) -> Json<Value> {
    let roster: Vec<Value> = state
        .config
        .agents
        .iter()
        .map(|a| {
            json!({
                "id": a.id,
                "role": a.role,
                "model": a.model,
                "skills": a.skills,
                "fallback_models": a.fallback_models,
                "online": cleo::heartbeat::is_online(&state.workdir, &a.id),
            })
        })
        .collect();
    Json(json!({"agents": roster}))
}

async fn usage(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.tracker.summary())
}

async fn usage_recent(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"calls": state.tracker.recent_calls(50)}))
}

async fn config(State(state): State<Arc<AppState>>) -> Json<Value> {
    let raw = serde_json::to_value(&state.config).unwrap_or_default();
    Json(mask_config(raw))
}

async fn doctor_report(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(doctor::report(&state.workdir))
}

async fn heartbeats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let beats: Vec<Value> = all_heartbeats(&state.workdir)
        .into_iter()
        .map(|(id, hb, online)| {
            json!({
                "agent_id": id,
                "status": hb.status,
                "progress": hb.progress,
                "ts": hb.ts,
                "online": online,
            })
        })
        .collect();
    Json(json!({"heartbeats": beats}))
}

/// Mask anything that looks like an API key and annotate `*_env` key
/// references with whether the variable is actually set.
pub fn mask_config(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, val) in map {
                let lower = key.to_lowercase();
                if lower.contains("api") && lower.contains("key") && !lower.ends_with("_env") {
                    if let Value::String(s) = &val {
                        if !s.is_empty() {
                            out.insert(key, json!("***"));
                            continue;
                        }
                    }
                }
                if lower.ends_with("_env") {
                    if let Value::String(name) = &val {
                        if !name.is_empty() {
                            let set = std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false);
                            let suffix = if set { " (set)" } else { " (not set)" };
                            out.insert(key, json!(format!("{name}{suffix}")));
                            continue;
                        }
                    }
                }
                out.insert(key, mask_config(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(mask_config).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_api_keys() {
        let masked = mask_config(json!({
            "llm": {"api_key": "sk-secret", "provider": "openai"},
            "nested": [{"MY_API_KEY": "abc"}],
        }));
        assert_eq!(masked["llm"]["api_key"], "***");
        assert_eq!(masked["llm"]["provider"], "openai");
        assert_eq!(masked["nested"][0]["MY_API_KEY"], "***");
    }

    #[test]
    fn test_env_annotations() {
        std::env::set_var("CLEO_TEST_SET_KEY", "x");
        let masked = mask_config(json!({
            "api_key_env": "CLEO_TEST_SET_KEY",
            "base_url_env": "CLEO_TEST_UNSET_KEY_XYZ",
        }));
        assert_eq!(masked["api_key_env"], "CLEO_TEST_SET_KEY (set)");
        assert_eq!(masked["base_url_env"], "CLEO_TEST_UNSET_KEY_XYZ (not set)");
        std::env::remove_var("CLEO_TEST_SET_KEY");
    }
}

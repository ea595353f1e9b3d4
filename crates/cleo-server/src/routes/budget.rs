//! Budget and alerts endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use cleo::usage::Budget;

use crate::state::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/budget", get(get_budget).post(set_budget))
        .route("/v1/alerts", get(alerts))
        .with_state(state)
}

async fn get_budget(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.tracker.budget_status())
}

#[derive(Deserialize)]
struct BudgetBody {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    max_cost_usd: f64,
    #[serde(default)]
    max_tokens: u64,
    #[serde(default = "default_warn")]
    warn_at_percent: u32,
}

fn default_warn() -> u32 {
    80
}

async fn set_budget(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BudgetBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let budget = Budget {
        enabled: body.enabled,
        max_cost_usd: body.max_cost_usd,
        max_tokens: body.max_tokens,
        warn_at_percent: body.warn_at_percent,
        updated_at: 0.0,
    };
    match state.tracker.set_budget(&budget) {
        Ok(()) => Ok(Json(state.tracker.budget_status())),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )),
    }
}

async fn alerts(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"alerts": state.tracker.get_alerts(50)}))
}

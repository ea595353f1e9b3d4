//! Compact state snapshot shared by the SSE and WebSocket push channels.
//!
//! Task fields are abbreviated to keep frames small: `s` status, `a`
//! agent, `d` description (first 60 chars), `ca`/`co` claim/complete
//! timestamps, `rc` retry count, `rs` average review score.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash as _, Hasher as _};

use serde_json::{json, Map, Value};

use crate::state::AppState;

pub fn build_snapshot(state: &AppState) -> Value {
    let mut tasks = Map::new();
    for t in state.board.all() {
        let mut compact = Map::new();
        compact.insert("s".into(), json!(t.status.as_str()));
        compact.insert("a".into(), json!(t.agent_id));
        let d: String = t.description.chars().take(60).collect();
        compact.insert("d".into(), json!(d));
        compact.insert("ca".into(), json!(t.claimed_at));
        compact.insert("co".into(), json!(t.completed_at));
        compact.insert("rc".into(), json!(t.retry_count));
        if !t.review_scores.is_empty() {
            compact.insert("rs".into(), json!(t.avg_review_score() as i64));
        }
        tasks.insert(t.task_id, Value::Object(compact));
    }

    let agents: Vec<Value> = cleo::heartbeat::all_heartbeats(&state.workdir)
        .into_iter()
        .map(|(id, hb, online)| {
            json!({
                "id": id,
                "status": hb.status,
                "progress": hb.progress,
                "online": online,
            })
        })
        .collect();

    let budget = state.tracker.budget_status();

    json!({
        "ts": cleo::now_ts(),
        "tasks": tasks,
        "agents": agents,
        "budget": {
            "enabled": budget["enabled"],
            "current_cost_usd": budget["current_cost_usd"],
            "max_cost_usd": budget["max_cost_usd"],
            "percent_used": budget["percent_used"],
        },
    })
}

/// Stable hash over the snapshot minus its timestamp, so unchanged state
/// produces no push.
pub fn snapshot_hash(snapshot: &Value) -> u64 {
    let mut clone = snapshot.clone();
    if let Some(obj) = clone.as_object_mut() {
        obj.remove("ts");
    }
    let mut hasher = DefaultHasher::new();
    clone.to_string().hash(&mut hasher);
    hasher.finish()
}

//! Gateway surface tests driven through the router with `tower::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt as _;
use serde_json::{json, Value};
use tower::ServiceExt as _;

use cleo::config::CleoConfig;
use cleo::workdir::Workdir;
use cleo_server::routes;
use cleo_server::state::AppState;

const TOKEN: &str = "test-token-1234";

fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
    let config: CleoConfig = serde_yaml::from_str(
        r#"
a2a:
  server:
    enabled: true
agents:
  - id: leo
    role: Planner and coordinator
    model: qwen3-235b-thinking
  - id: jerry
    role: Implementation agent
    model: deepseek-v3.2
"#,
    )
    .unwrap();
    AppState::new(Workdir::new(dir.path()), config, TOKEN.to_string(), 19789)
}

fn get(path: &str, with_token: bool) -> Request<Body> {
    let mut builder = Request::builder().uri(path);
    if with_token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn post_json(path: &str, body: Value, with_token: bool) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if with_token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_public_and_protected_paths() {
    let dir = tempfile::tempdir().unwrap();
    let app = routes::configure(test_state(&dir));

    // Public probes need no token.
    let resp = app.clone().oneshot(get("/health", false)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["agents"], 2);
    assert_eq!(body["port"], 19789);

    let resp = app
        .clone()
        .oneshot(get("/.well-known/agent.json", false))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let card = body_json(resp).await;
    assert_eq!(card["protocol"], "a2a/0.3");

    // Everything else is bearer-gated.
    let resp = app.clone().oneshot(get("/v1/status", false)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let resp = app.clone().oneshot(get("/v1/status", true)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_task_lifecycle_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let app = routes::configure(state.clone());

    let resp = app
        .clone()
        .oneshot(post_json("/v1/task", json!({"description": "What is 2+2?"}), true))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let task_id = body_json(resp).await["task_id"].as_str().unwrap().to_string();

    // Visible through GET, pending, routed to the planner.
    let resp = app
        .clone()
        .oneshot(get(&format!("/v1/task/{task_id}"), true))
        .await
        .unwrap();
    let task = body_json(resp).await;
    assert_eq!(task["status"], "pending");
    assert_eq!(task["required_role"], "planner");

    // Pause → resume → cancel → retry.
    for (verb, expect) in [("pause", true), ("resume", true), ("cancel", true), ("retry", true)] {
        let resp = app
            .clone()
            .oneshot(post_json(&format!("/v1/task/{task_id}/{verb}"), json!({}), true))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["ok"], expect, "verb {verb}");
    }

    let resp = app
        .clone()
        .oneshot(post_json("/v1/tasks/cancel_all", json!({}), true))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["cancelled"], 1);

    let resp = app
        .clone()
        .oneshot(get("/v1/task/unknown-id", true))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_budget_roundtrip_and_alerts() {
    let dir = tempfile::tempdir().unwrap();
    let app = routes::configure(test_state(&dir));

    let resp = app
        .clone()
        .oneshot(post_json(
            "/v1/budget",
            json!({"enabled": true, "max_cost_usd": 2.5, "warn_at_percent": 70}),
            true,
        ))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["enabled"], true);
    assert_eq!(body["max_cost_usd"], 2.5);

    let resp = app.clone().oneshot(get("/v1/budget", true)).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["max_cost_usd"], 2.5);
    assert_eq!(body["percent_used"], 0.0);

    let resp = app.clone().oneshot(get("/v1/alerts", true)).await.unwrap();
    assert!(body_json(resp).await["alerts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_skills_crud_and_name_validation() {
    let dir = tempfile::tempdir().unwrap();
    let app = routes::configure(test_state(&dir));

    let resp = app
        .clone()
        .oneshot(post_json("/v1/skills/team/regenerate", json!({}), true))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert!(body["content"].as_str().unwrap().contains("leo"));

    let put = Request::builder()
        .method("PUT")
        .uri("/v1/skills/research-habits")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::from(json!({"content": "# Research habits"}).to_string()))
        .unwrap();
    assert_eq!(app.clone().oneshot(put).await.unwrap().status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(get("/v1/skills/research-habits", true))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["content"], "# Research habits");

    // Traversal-shaped names are rejected up front.
    let put = Request::builder()
        .method("PUT")
        .uri("/v1/skills/..%2F..%2Fetc")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::from(json!({"content": "nope"}).to_string()))
        .unwrap();
    assert_eq!(
        app.clone().oneshot(put).await.unwrap().status(),
        StatusCode::BAD_REQUEST
    );

    let resp = app.clone().oneshot(get("/v1/skills", true)).await.unwrap();
    let names = body_json(resp).await;
    assert!(names["skills"]
        .as_array()
        .unwrap()
        .iter()
        .any(|n| n == "research-habits"));
}

#[tokio::test]
async fn test_a2a_rpc_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir);
    let app = routes::configure(state.clone());

    let resp = app
        .clone()
        .oneshot(post_json(
            "/a2a",
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "message/send",
                "params": {"message": {"role": "user", "parts": [{"kind": "text", "text": "What is 2+2?"}]}},
            }),
            true,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    let a2a_id = body["result"]["id"].as_str().unwrap();
    assert!(a2a_id.starts_with("a2a-"));
    assert_eq!(body["result"]["status"]["state"], "submitted");

    // The board got a planner task with the A2A source marker.
    let cleo_id = state.a2a.bridge().cleo_id_for(a2a_id).unwrap();
    let desc = state.board.get(&cleo_id).unwrap().description;
    assert!(desc.starts_with("[A2A source: ctx-"));
    assert!(desc.ends_with("What is 2+2?"));

    // Unknown methods come back as JSON-RPC errors, not HTTP errors.
    let resp = app
        .clone()
        .oneshot(post_json(
            "/a2a",
            json!({"jsonrpc": "2.0", "id": 2, "method": "tasks/list"}),
            true,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["error"]["code"], -32601);
}

#[tokio::test]
async fn test_config_masks_keys() {
    let dir = tempfile::tempdir().unwrap();
    let app = routes::configure(test_state(&dir));
    let resp = app.clone().oneshot(get("/v1/config", true)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["agents"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_observability_endpoints_answer() {
    let dir = tempfile::tempdir().unwrap();
    let app = routes::configure(test_state(&dir));
    for path in [
        "/v1/scores",
        "/v1/agents",
        "/v1/usage",
        "/v1/usage/recent",
        "/v1/doctor",
        "/v1/heartbeat",
        "/v1/memory/status",
        "/v1/memory/kb/notes",
    ] {
        let resp = app.clone().oneshot(get(path, true)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "path {path}");
    }
}

//! Route configuration: one module per endpoint group, merged behind the
//! bearer-token middleware, permissive CORS, and the 10 MB body cap.

pub mod a2a;
pub mod agents;
pub mod budget;
pub mod events;
pub mod health;
pub mod memory;
pub mod observe;
pub mod skills;
pub mod tasks;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::auth;
use crate::state::AppState;

pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub fn configure(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::routes(state.clone()))
        .merge(tasks::routes(state.clone()))
        .merge(observe::routes(state.clone()))
        .merge(budget::routes(state.clone()))
        .merge(skills::routes(state.clone()))
        .merge(agents::routes(state.clone()))
        .merge(memory::routes(state.clone()))
        .merge(events::routes(state.clone()))
        .merge(a2a::routes(state.clone()))
        .layer(middleware::from_fn_with_state(state, auth::check_token))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

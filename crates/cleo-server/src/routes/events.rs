//! `GET /v1/events`: server-sent state stream.
//!
//! Pushes an `event: state` frame whenever the compact snapshot hashes to
//! a new value, at most once per 1.5 s; keepalive comments cover the gaps
//! so proxies don't drop the connection.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::Stream;

use crate::snapshot::{build_snapshot, snapshot_hash};
use crate::state::AppState;

/// Minimum gap between state pushes.
const PUSH_INTERVAL: Duration = Duration::from_millis(1500);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/events", get(events))
        .with_state(state)
}

async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures::stream::unfold(
        (state, 0u64, tokio::time::Instant::now() - PUSH_INTERVAL),
        |(state, last_hash, last_push)| async move {
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                if last_push.elapsed() < PUSH_INTERVAL {
                    continue;
                }
                let snapshot = build_snapshot(&state);
                let hash = snapshot_hash(&snapshot);
                if hash == last_hash {
                    continue;
                }
                let event = Event::default().event("state").data(snapshot.to_string());
                return Some((
                    Ok(event),
                    (state, hash, tokio::time::Instant::now()),
                ));
            }
        },
    );

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(5))
            .text("keepalive"),
    )
}

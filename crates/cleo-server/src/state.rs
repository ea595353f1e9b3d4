//! Shared application state.
//!
//! The gateway source of truth stays on disk (board, usage, heartbeats);
//! this struct only carries handles, the auth token, and startup facts.
//! Constructed once at startup and passed by `Arc`; no module globals.

use std::sync::Arc;
use std::time::Instant;

use cleo::board::TaskBoard;
use cleo::bus::ContextBus;
use cleo::config::CleoConfig;
use cleo::orchestrator::Orchestrator;
use cleo::usage::UsageTracker;
use cleo::workdir::Workdir;
use cleo_a2a::server::A2AServer;

pub struct AppState {
    pub workdir: Workdir,
    pub config: CleoConfig,
    pub token: String,
    pub port: u16,
    pub started_at: Instant,
    pub board: TaskBoard,
    pub bus: ContextBus,
    pub tracker: UsageTracker,
    pub orchestrator: tokio::sync::Mutex<Orchestrator>,
    pub a2a: A2AServer,
}

impl AppState {
    pub fn new(workdir: Workdir, config: CleoConfig, token: String, port: u16) -> Arc<Self> {
        let board = TaskBoard::new(&workdir);
        let bus = ContextBus::new(&workdir);
        let tracker = UsageTracker::new(&workdir);
        let orchestrator = tokio::sync::Mutex::new(Orchestrator::new(workdir.clone(), config.clone()));

        let hostname = std::env::var("CLEO_HOSTNAME").unwrap_or_else(|_| format!("localhost:{port}"));
        let scheme = if hostname.contains("localhost") { "http" } else { "https" };
        let a2a = A2AServer::new(
            workdir.clone(),
            config.a2a.server.enabled,
            format!("{scheme}://{hostname}/a2a"),
        );

        Arc::new(Self {
            workdir,
            config,
            token,
            port,
            started_at: Instant::now(),
            board,
            bus,
            tracker,
            orchestrator,
            a2a,
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Background maintenance: stale-task recovery, review/close-out ticket
/// minting, and the TextGrad pipeline, at the orchestrator poll cadence.
pub fn spawn_maintenance(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(cleo::orchestrator::POLL_INTERVAL).await;
            let mut orch = state.orchestrator.lock().await;
            if let Err(e) = orch.tick_all() {
                tracing::warn!(error = %e, "maintenance tick failed");
            }
        }
    })
}

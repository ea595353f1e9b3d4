use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use cleo::config::{self, CleoConfig};
use cleo::provider::{HttpProvider, Provider, ScriptedProvider};
use cleo::worker::{Worker, WorkerOptions};
use cleo::workdir::Workdir;
use cleo_a2a::client::A2AClient;
use cleo_server::routes;
use cleo_server::state::{spawn_maintenance, AppState};
use cleo_server::ws;

#[derive(Parser)]
#[command(name = "cleod", author, version, about = "Cleo gateway and worker daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP + WebSocket gateway.
    Serve {
        /// Listen port (default CLEO_GATEWAY_PORT or 19789).
        #[arg(long)]
        port: Option<u16>,
        /// Working directory holding the shared state files.
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    /// Run one agent worker loop.
    Worker {
        /// Agent id from config/agents.yaml.
        #[arg(long)]
        agent_id: String,
        /// Working directory holding the shared state files.
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Commands::Serve { port, workdir } => serve(port, workdir).await,
        Commands::Worker { agent_id, workdir } => run_worker(agent_id, workdir).await,
    }
}

async fn serve(port: Option<u16>, workdir: Option<PathBuf>) -> anyhow::Result<()> {
    let workdir = workdir.map(Workdir::new).unwrap_or_default();
    config::load_dotenv(&workdir);
    let cleo_config = CleoConfig::load(&workdir)?;
    let port = port.unwrap_or_else(config::gateway_port);
    let token = config::gateway_token();

    let state = AppState::new(workdir, cleo_config, token, port);
    spawn_maintenance(state.clone());

    // The WebSocket gateway rides on the next port up.
    let ws_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = ws::serve(ws_state).await {
            tracing::error!(error = %e, "WebSocket gateway failed");
        }
    });

    let app = routes::configure(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_worker(agent_id: String, workdir: Option<PathBuf>) -> anyhow::Result<()> {
    let workdir = workdir.map(Workdir::new).unwrap_or_default();
    config::load_dotenv(&workdir);
    let cleo_config = CleoConfig::load(&workdir)?;
    let agent = cleo_config
        .agent(&agent_id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("agent '{agent_id}' is not in config/agents.yaml"))?;

    let provider: Arc<dyn Provider> = if agent.llm.api_key_env.is_empty() {
        // No provider configured: answer with a canned notice instead of
        // wedging the board.
        tracing::warn!(agent_id, "no api_key_env configured; using a scripted provider");
        Arc::new(ScriptedProvider::single(
            "No LLM provider is configured for this agent.",
        ))
    } else {
        Arc::new(HttpProvider::from_env(
            &agent.llm.api_key_env,
            &agent.llm.base_url_env,
            cleo_config.resilience.clone(),
        ))
    };

    let mut worker = Worker::new(
        workdir.clone(),
        cleo_config.clone(),
        agent,
        provider,
        WorkerOptions {
            // Exit after ~8 minutes of continuous idling so orphaned
            // workers drain away; the orchestrator restarts them per run.
            max_idle_polls: 240,
            ..Default::default()
        },
    );
    if cleo_config.a2a.client.enabled {
        worker = worker.with_delegator(Arc::new(A2AClient::new(
            workdir,
            cleo_config.a2a.client.clone(),
        )));
    }

    tokio::select! {
        _ = worker.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(agent_id = %worker.agent_id(), "interrupt; worker exiting");
        }
    }
    Ok(())
}

//! Cleo core coordination substrate.
//!
//! A team of independently-running agent workers cooperatively plan, execute,
//! review, and synthesize a final answer, coordinating entirely through
//! file-locked shared state and local mailboxes. This crate holds the
//! TaskBoard, the structured inter-agent protocols, the orchestrator and the
//! per-agent worker loop; the A2A interoperability layer lives in `cleo-a2a`
//! and the HTTP gateway in `cleo-server`.

pub mod board;
pub mod bus;
pub mod config;
pub mod doctor;
pub mod heartbeat;
pub mod live_status;
pub mod lockfile;
pub mod mailbox;
pub mod orchestrator;
pub mod protocols;
pub mod provider;
pub mod router;
pub mod skills;
pub mod textgrad;
pub mod tools;
pub mod usage;
pub mod worker;
pub mod workdir;

pub use board::{Task, TaskBoard, TaskStatus};
pub use bus::ContextBus;
pub use config::CleoConfig;
pub use orchestrator::Orchestrator;
pub use usage::{UsageError, UsageTracker};

/// Current wall-clock time as fractional epoch seconds.
///
/// Board and protocol timestamps are stored in this format so documents
/// written by older runs keep loading.
pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

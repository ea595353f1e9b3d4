//! Working-directory layout.
//!
//! All shared state lives in flat files under one working directory; every
//! component receives a [`Workdir`] rather than hard-coding paths so tests
//! can run against a scratch directory.

use std::path::{Path, PathBuf};

pub const BOARD_FILE: &str = ".task_board.json";
pub const BOARD_LOCK: &str = ".task_board.lock";
pub const BUS_FILE: &str = ".context_bus.json";
pub const BUS_LOCK: &str = ".context_bus.lock";
pub const MAILBOX_DIR: &str = ".mailboxes";
pub const HEARTBEAT_DIR: &str = ".heartbeats";
pub const A2A_TASK_MAP_FILE: &str = ".a2a_task_map.json";
pub const USAGE_FILE: &str = "memory/usage_stats.json";
pub const USAGE_LOCK: &str = "memory/usage_stats.lock";
pub const ALERTS_FILE: &str = "memory/alerts.jsonl";
pub const CRITIQUE_LOG_FILE: &str = "memory/critique_log.jsonl";
pub const CRITIQUE_LOG_LOCK: &str = "memory/critique_log.lock";
pub const BUDGET_FILE: &str = "config/budget.json";
pub const AGENTS_CONFIG_FILE: &str = "config/agents.yaml";
pub const SKILLS_DIR: &str = "skills";
pub const OVERRIDES_DIR: &str = "skills/agent_overrides";

/// Root of one Cleo deployment's shared state.
#[derive(Debug, Clone)]
pub struct Workdir {
    root: PathBuf,
}

impl Workdir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve from the current directory (the default for CLI runs).
    pub fn current() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn board_file(&self) -> PathBuf {
        self.join(BOARD_FILE)
    }

    pub fn board_lock(&self) -> PathBuf {
        self.join(BOARD_LOCK)
    }

    pub fn bus_file(&self) -> PathBuf {
        self.join(BUS_FILE)
    }

    pub fn bus_lock(&self) -> PathBuf {
        self.join(BUS_LOCK)
    }

    pub fn mailbox_dir(&self) -> PathBuf {
        self.join(MAILBOX_DIR)
    }

    pub fn heartbeat_dir(&self) -> PathBuf {
        self.join(HEARTBEAT_DIR)
    }

    pub fn heartbeat_file(&self, agent_id: &str) -> PathBuf {
        self.heartbeat_dir().join(format!("{agent_id}.json"))
    }

    pub fn a2a_task_map(&self) -> PathBuf {
        self.join(A2A_TASK_MAP_FILE)
    }

    pub fn usage_file(&self) -> PathBuf {
        self.join(USAGE_FILE)
    }

    pub fn usage_lock(&self) -> PathBuf {
        self.join(USAGE_LOCK)
    }

    pub fn alerts_file(&self) -> PathBuf {
        self.join(ALERTS_FILE)
    }

    pub fn critique_log(&self) -> PathBuf {
        self.join(CRITIQUE_LOG_FILE)
    }

    pub fn critique_log_lock(&self) -> PathBuf {
        self.join(CRITIQUE_LOG_LOCK)
    }

    pub fn budget_file(&self) -> PathBuf {
        self.join(BUDGET_FILE)
    }

    pub fn agents_config(&self) -> PathBuf {
        self.join(AGENTS_CONFIG_FILE)
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.join(SKILLS_DIR)
    }

    pub fn overrides_dir(&self) -> PathBuf {
        self.join(OVERRIDES_DIR)
    }

    pub fn gradient_signal_file(&self, agent_id: &str) -> PathBuf {
        self.join(&format!("memory/gradient_signal_{agent_id}.json"))
    }

    /// Workspace directory for task outputs and A2A attachments.
    ///
    /// Overridable via `CLEO_WORKSPACE`; defaults to `workspace/` under the
    /// root.
    pub fn workspace(&self) -> PathBuf {
        match std::env::var("CLEO_WORKSPACE") {
            Ok(w) if !w.is_empty() => {
                let p = PathBuf::from(&w);
                if p.is_absolute() {
                    p
                } else {
                    self.join(&w)
                }
            }
            _ => self.join("workspace"),
        }
    }
}

impl Default for Workdir {
    fn default() -> Self {
        Self::current()
    }
}

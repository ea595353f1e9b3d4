//! Spawn-and-poll scheduler.
//!
//! The orchestrator submits the root planner task, launches one worker
//! process per configured agent, and polls the board until quiescence:
//! recovering stale tasks, minting review tickets for submitted work,
//! and minting the close-out ticket once a decomposed run settles. It
//! holds no in-memory state that matters: everything flows through the
//! board, so a crashed orchestrator can be restarted.

use std::collections::HashSet;
use std::process::Child;
use std::time::Duration;

use crate::board::{Task, TaskBoard, TaskStatus};
use crate::bus::ContextBus;
use crate::config::CleoConfig;
use crate::protocols::IntentAnchor;
use crate::router::classify_task;
use crate::textgrad::TextGradPipeline;
use crate::worker::{CLOSEOUT_MARKER, REVIEW_MARKER};
use crate::workdir::Workdir;

/// Poll cadence for the wait loop (≥ 0.5 Hz per the coordination contract).
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Ticks without any task transition before the run is declared dead.
pub const MAX_IDLE_CYCLES: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// All tasks settled; result collected.
    Quiescent,
    /// No transition for `MAX_IDLE_CYCLES` ticks: workers died or wedged.
    Stalled,
}

pub struct Orchestrator {
    workdir: Workdir,
    config: CleoConfig,
    board: TaskBoard,
    bus: ContextBus,
    textgrad: TextGradPipeline,
    children: Vec<Child>,
}

impl Orchestrator {
    pub fn new(workdir: Workdir, config: CleoConfig) -> Self {
        let board = TaskBoard::new(&workdir);
        let bus = ContextBus::new(&workdir);
        let textgrad = TextGradPipeline::new(workdir.clone());
        Self {
            workdir,
            config,
            board,
            bus,
            textgrad,
            children: Vec::new(),
        }
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    /// Submit a user request: anchor the intent, pre-classify for the
    /// record, and create the root planner task.
    pub fn submit(&self, description: &str) -> anyhow::Result<String> {
        let route = classify_task(description);
        let task = self.board.create(
            description.to_string(),
            Vec::new(),
            0,
            Some("planner".to_string()),
            None,
        )?;
        self.bus.put_intent(&IntentAnchor {
            user_message: description.to_string(),
            core_goal: String::new(),
            success_criteria: Vec::new(),
            task_id: task.task_id.clone(),
        });
        tracing::info!(
            task_id = %task.task_id,
            route = ?route,
            "submitted root task"
        );
        Ok(task.task_id)
    }

    /// Spawn one worker child process per configured agent, running this
    /// same binary's `worker` subcommand.
    pub fn launch_all(&mut self) -> anyhow::Result<()> {
        let exe = std::env::current_exe()?;
        for agent in &self.config.agents {
            let child = std::process::Command::new(&exe)
                .arg("worker")
                .arg("--agent-id")
                .arg(&agent.id)
                .arg("--workdir")
                .arg(self.workdir.root())
                .spawn()?;
            tracing::info!(agent_id = %agent.id, pid = child.id(), "launched worker");
            self.children.push(child);
        }
        Ok(())
    }

    /// Poll until global quiescence (or the idle bound), then reap
    /// children. Each tick also runs recovery and ticket minting.
    pub async fn wait(&mut self, root_task_id: &str) -> anyhow::Result<RunOutcome> {
        let mut idle_cycles: u32 = 0;
        let mut last_fingerprint = String::new();

        let outcome = loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            self.tick(root_task_id)?;

            let tasks = self.board.all();
            let fingerprint = fingerprint(&tasks);
            if fingerprint == last_fingerprint {
                idle_cycles += 1;
            } else {
                idle_cycles = 0;
                last_fingerprint = fingerprint;
            }

            let active = tasks.iter().any(|t| t.status.is_active());
            if !active {
                break RunOutcome::Quiescent;
            }
            if idle_cycles >= MAX_IDLE_CYCLES {
                tracing::error!(
                    idle_cycles,
                    "no task transitions; declaring the run stalled"
                );
                break RunOutcome::Stalled;
            }
        };

        self.shutdown_children();
        Ok(outcome)
    }

    /// One maintenance tick. Public so embedded runs (tests, the gateway
    /// daemon) can drive the loop themselves.
    pub fn tick(&mut self, root_task_id: &str) -> anyhow::Result<()> {
        self.board.recover_stale_tasks()?;
        self.mint_review_tickets()?;
        self.mint_closeout(root_task_id)?;
        if self.textgrad.should_run(60.0) {
            let stats = self.textgrad.run();
            tracing::info!(?stats, "textgrad pipeline ran");
        }
        Ok(())
    }

    /// Maintenance across every root on the board, for daemon mode where
    /// tasks arrive through the gateway rather than a single `submit`.
    pub fn tick_all(&mut self) -> anyhow::Result<()> {
        self.board.recover_stale_tasks()?;
        self.mint_review_tickets()?;
        let roots: Vec<String> = self
            .board
            .all()
            .into_iter()
            .filter(|t| {
                t.parent_id.is_none()
                    && matches!(t.required_role.as_deref(), Some("planner") | Some("plan"))
            })
            .map(|t| t.task_id)
            .collect();
        for root in roots {
            self.mint_closeout(&root)?;
        }
        if self.textgrad.should_run(60.0) {
            let stats = self.textgrad.run();
            tracing::info!(?stats, "textgrad pipeline ran");
        }
        Ok(())
    }

    /// Every task sitting in review gets exactly one open reviewer ticket.
    fn mint_review_tickets(&self) -> anyhow::Result<()> {
        let tasks = self.board.all();
        let ticketed: HashSet<String> = tasks
            .iter()
            .filter_map(|t| {
                t.description
                    .strip_prefix(REVIEW_MARKER)
                    .and_then(|rest| rest.split(']').next())
                    .map(|id| id.to_string())
            })
            .collect();

        for task in &tasks {
            if task.status != TaskStatus::Review {
                continue;
            }
            if task.description.starts_with(REVIEW_MARKER)
                || task.description.starts_with(CLOSEOUT_MARKER)
            {
                continue;
            }
            // Planner output is not peer-reviewed.
            if matches!(task.required_role.as_deref(), Some("planner") | Some("plan")) {
                continue;
            }
            if ticketed.contains(&task.task_id) {
                continue;
            }
            let preview: String = task.description.chars().take(80).collect();
            self.board.create(
                format!("{REVIEW_MARKER}{}] {preview}", task.task_id),
                Vec::new(),
                0,
                Some("review".to_string()),
                Some(task.task_id.clone()),
            )?;
            tracing::debug!(task_id = %task.task_id, "minted review ticket");
        }
        Ok(())
    }

    /// When a decomposed run settles (root completed, every child
    /// terminal), mint the planner close-out ticket exactly once.
    fn mint_closeout(&self, root_task_id: &str) -> anyhow::Result<()> {
        let tasks = self.board.all();
        let marker = format!("{CLOSEOUT_MARKER}{root_task_id}");
        if tasks.iter().any(|t| t.description.starts_with(&marker)) {
            return Ok(());
        }
        let Some(root) = tasks.iter().find(|t| t.task_id == root_task_id) else {
            return Ok(());
        };
        if root.status != TaskStatus::Completed {
            return Ok(());
        }
        let children: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.parent_id.as_deref() == Some(root_task_id))
            .collect();
        if children.is_empty() {
            // Direct answer; nothing to synthesize.
            return Ok(());
        }
        if !children.iter().all(|t| t.status.is_terminal()) {
            return Ok(());
        }
        self.board.create(
            marker,
            Vec::new(),
            0,
            Some("planner".to_string()),
            Some(root_task_id.to_string()),
        )?;
        tracing::info!(root = %root_task_id, "minted close-out ticket");
        Ok(())
    }

    /// Final result for the caller.
    pub fn collect(&self, root_task_id: &str) -> String {
        self.board.collect_results(root_task_id)
    }

    fn shutdown_children(&mut self) {
        for mut child in self.children.drain(..) {
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown_children();
    }
}

/// Cheap change detector over the whole board.
fn fingerprint(tasks: &[Task]) -> String {
    tasks
        .iter()
        .map(|t| format!("{}={};", t.task_id, t.status))
        .collect()
}

//! File-locked task lifecycle store and work-queue.
//!
//! The board is one JSON document mapping `task_id → task record`, guarded
//! by an advisory file lock so every agent process can mutate it safely.
//! Agents self-claim in the Agent Teams style: each worker independently
//! grabs the next available task it qualifies for. Tasks can be blocked by
//! other task ids, routed to a role, and auto-recovered when a holder
//! crashes.

pub mod roles;
mod task;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use crate::lockfile::LockGuard;
use crate::now_ts;
use crate::workdir::Workdir;

pub use task::{CritiqueRecord, ReviewScore, Task, TaskStatus};

/// Stale-claim threshold: the holding agent crashed or hung.
pub const CLAIMED_TIMEOUT_SECS: f64 = 600.0;
/// Stale-review threshold: the reviewer crashed.
pub const REVIEW_TIMEOUT_SECS: f64 = 300.0;

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("board I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("board serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

type BoardData = BTreeMap<String, Task>;
type Result<T> = std::result::Result<T, BoardError>;

/// File-backed task store.
///
/// All mutating methods acquire the board lock around the full
/// read-modify-write cycle; reads without the lock accept racy snapshots.
#[derive(Debug, Clone)]
pub struct TaskBoard {
    path: PathBuf,
    lock_path: PathBuf,
}

impl TaskBoard {
    pub fn new(workdir: &Workdir) -> Self {
        Self {
            path: workdir.board_file(),
            lock_path: workdir.board_lock(),
        }
    }

    // ── Create ──────────────────────────────────────────────────────────

    pub fn create(
        &self,
        description: impl Into<String>,
        blocked_by: Vec<String>,
        min_reputation: i64,
        required_role: Option<String>,
        parent_id: Option<String>,
    ) -> Result<Task> {
        let mut task = Task::new(description);
        task.blocked_by = blocked_by;
        task.min_reputation = min_reputation;
        task.required_role = required_role;
        task.parent_id = parent_id;

        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        data.insert(task.task_id.clone(), task.clone());
        self.write(&data)?;
        Ok(task)
    }

    /// Shorthand for a task with no blockers, gate, role, or parent.
    pub fn create_simple(&self, description: impl Into<String>) -> Result<Task> {
        self.create(description, Vec::new(), 0, None, None)
    }

    // ── Self-claim ──────────────────────────────────────────────────────

    /// Atomically grab the next available unblocked task this agent
    /// qualifies for. Scans in creation order; the file lock prevents two
    /// agents claiming the same task.
    pub fn claim_next(
        &self,
        agent_id: &str,
        agent_reputation: i64,
        _agent_role: Option<&str>,
    ) -> Result<Option<Task>> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();

        let completed_ids: Vec<String> = data
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.task_id.clone())
            .collect();

        let candidate = ordered_ids(&data).into_iter().find(|tid| {
            let t = &data[tid];
            if t.status != TaskStatus::Pending {
                return false;
            }
            if t.min_reputation > agent_reputation {
                return false;
            }
            if t.blocked_by.iter().any(|b| !completed_ids.contains(b)) {
                return false;
            }
            if !roles::agent_may_claim(agent_id, t.required_role.as_deref()) {
                return false;
            }
            if let Some(role) = &t.required_role {
                if !roles::role_matches(role, agent_id) {
                    return false;
                }
            }
            true
        });

        match candidate {
            Some(tid) => {
                let t = data.get_mut(&tid).expect("candidate came from this map");
                t.status = TaskStatus::Claimed;
                t.agent_id = Some(agent_id.to_string());
                t.claimed_at = Some(now_ts());
                let claimed = t.clone();
                self.write(&data)?;
                Ok(Some(claimed))
            }
            None => Ok(None),
        }
    }

    /// Executor claims its own critique task for a targeted revision. Only
    /// the original holder qualifies.
    pub fn claim_critique(&self, agent_id: &str) -> Result<Option<Task>> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();

        let candidate = ordered_ids(&data).into_iter().find(|tid| {
            let t = &data[tid];
            t.status == TaskStatus::Critique && t.agent_id.as_deref() == Some(agent_id)
        });

        match candidate {
            Some(tid) => {
                let t = data.get_mut(&tid).expect("candidate came from this map");
                t.status = TaskStatus::Claimed;
                t.claimed_at = Some(now_ts());
                let claimed = t.clone();
                self.write(&data)?;
                Ok(Some(claimed))
            }
            None => Ok(None),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn submit_for_review(&self, task_id: &str, result: impl Into<String>) -> Result<()> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let Some(t) = data.get_mut(task_id) else {
            tracing::warn!(task_id, "submit_for_review: task not found");
            return Ok(());
        };
        t.status = TaskStatus::Review;
        t.result = Some(result.into());
        t.review_submitted_at = Some(now_ts());
        self.write(&data)
    }

    /// Legacy simple-score append; does not transition status.
    pub fn add_review(
        &self,
        task_id: &str,
        reviewer_id: &str,
        score: i64,
        comment: &str,
    ) -> Result<()> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let Some(t) = data.get_mut(task_id) else {
            tracing::warn!(task_id, "add_review: task not found");
            return Ok(());
        };
        t.review_scores.push(ReviewScore {
            reviewer: reviewer_id.to_string(),
            score,
            comment: comment.to_string(),
            ts: now_ts(),
        });
        self.write(&data)
    }

    /// Advisor submits a structured critique with a quality score.
    ///
    /// The reviewer is an advisor, not a gatekeeper, but a first rejection
    /// gives the original executor one targeted revision pass: the task
    /// moves to `critique` and the holder re-claims it via
    /// [`claim_critique`](Self::claim_critique). From the second round on
    /// (or on a pass) the task always completes; the planner reads scores
    /// and suggestions during final synthesis.
    pub fn add_critique(
        &self,
        task_id: &str,
        reviewer_id: &str,
        passed: bool,
        suggestions: Vec<String>,
        comment: &str,
        score: i64,
    ) -> Result<()> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let Some(t) = data.get_mut(task_id) else {
            tracing::warn!(task_id, "add_critique: task not found");
            return Ok(());
        };
        t.critique = Some(CritiqueRecord {
            reviewer: reviewer_id.to_string(),
            passed,
            score,
            suggestions,
            comment: comment.to_string(),
            ts: now_ts(),
        });
        if !passed && t.critique_round == 0 {
            t.status = TaskStatus::Critique;
            t.critique_round = 1;
        } else {
            t.status = TaskStatus::Completed;
            t.completed_at = Some(now_ts());
        }
        self.write(&data)
    }

    /// Force-complete. No score-based rejection.
    pub fn complete(&self, task_id: &str) -> Result<Option<Task>> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let Some(t) = data.get_mut(task_id) else {
            tracing::warn!(task_id, "complete: task not found");
            return Ok(None);
        };
        t.status = TaskStatus::Completed;
        t.completed_at = Some(now_ts());
        let done = t.clone();
        self.write(&data)?;
        Ok(Some(done))
    }

    pub fn fail(&self, task_id: &str, reason: &str) -> Result<()> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let Some(t) = data.get_mut(task_id) else {
            tracing::warn!(task_id, "fail: task not found");
            return Ok(());
        };
        t.status = TaskStatus::Failed;
        t.completed_at = Some(now_ts());
        t.evolution_flags.push(format!("failed:{reason}"));
        self.write(&data)
    }

    /// Append a textual post-mortem tag.
    pub fn flag(&self, task_id: &str, tag: &str) -> Result<()> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let Some(t) = data.get_mut(task_id) else {
            return Ok(());
        };
        t.evolution_flags.push(tag.to_string());
        self.write(&data)
    }

    // ── Streaming partials / cost ───────────────────────────────────────

    pub fn update_partial(&self, task_id: &str, partial: &str) -> Result<()> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let Some(t) = data.get_mut(task_id) else {
            return Ok(());
        };
        t.partial_result = Some(partial.to_string());
        self.write(&data)
    }

    pub fn set_cost(&self, task_id: &str, delta_usd: f64) -> Result<()> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let Some(t) = data.get_mut(task_id) else {
            return Ok(());
        };
        t.cost_usd = ((t.cost_usd + delta_usd) * 1e6).round() / 1e6;
        self.write(&data)
    }

    // ── Cancel / pause / resume / retry ─────────────────────────────────

    /// Cancel a task. Returns false if it is unknown or already terminal.
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let Some(t) = data.get_mut(task_id) else {
            return Ok(false);
        };
        if matches!(t.status, TaskStatus::Completed | TaskStatus::Cancelled) {
            return Ok(false);
        }
        t.status = TaskStatus::Cancelled;
        t.completed_at = Some(now_ts());
        t.evolution_flags.push("user_cancelled".to_string());
        self.write(&data)?;
        Ok(true)
    }

    /// Pause a pending/claimed task.
    pub fn pause(&self, task_id: &str) -> Result<bool> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let Some(t) = data.get_mut(task_id) else {
            return Ok(false);
        };
        if !matches!(t.status, TaskStatus::Pending | TaskStatus::Claimed) {
            return Ok(false);
        }
        t.paused_from = Some(t.status.as_str().to_string());
        t.status = TaskStatus::Paused;
        self.write(&data)?;
        Ok(true)
    }

    /// Resume a paused task back to pending.
    pub fn resume(&self, task_id: &str) -> Result<bool> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let Some(t) = data.get_mut(task_id) else {
            return Ok(false);
        };
        if t.status != TaskStatus::Paused {
            return Ok(false);
        }
        t.status = TaskStatus::Pending;
        t.agent_id = None;
        t.claimed_at = None;
        t.paused_from = None;
        self.write(&data)?;
        Ok(true)
    }

    /// Retry a failed/cancelled task: reset to pending and count the retry.
    pub fn retry(&self, task_id: &str) -> Result<bool> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let Some(t) = data.get_mut(task_id) else {
            return Ok(false);
        };
        if !matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Ok(false);
        }
        t.status = TaskStatus::Pending;
        t.agent_id = None;
        t.claimed_at = None;
        t.completed_at = None;
        t.review_submitted_at = None;
        t.result = None;
        t.review_scores.clear();
        t.retry_count += 1;
        self.write(&data)?;
        Ok(true)
    }

    /// Cancel every non-terminal task. Returns the count cancelled.
    pub fn cancel_all(&self) -> Result<usize> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let mut cancelled = 0;
        for t in data.values_mut() {
            if !t.status.is_terminal() {
                t.status = TaskStatus::Cancelled;
                t.completed_at = Some(now_ts());
                t.evolution_flags.push("user_cancelled".to_string());
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            self.write(&data)?;
        }
        Ok(cancelled)
    }

    // ── Timeout recovery ────────────────────────────────────────────────

    /// Recover stale claimed/review/critique tasks. Called periodically by
    /// the orchestrator between polls; never regenerates output. Returns
    /// the recovered task ids.
    pub fn recover_stale_tasks(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        let now = now_ts();
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        let mut changed = false;

        for (tid, t) in data.iter_mut() {
            match t.status {
                TaskStatus::Claimed => {
                    let claimed_at = t.claimed_at.unwrap_or(0.0);
                    if claimed_at > 0.0 && (now - claimed_at) > CLAIMED_TIMEOUT_SECS {
                        t.status = TaskStatus::Pending;
                        t.agent_id = None;
                        t.claimed_at = None;
                        t.retry_count += 1;
                        t.evolution_flags
                            .push("timeout_recovered:claimed".to_string());
                        recovered.push(tid.clone());
                        changed = true;
                        tracing::warn!(
                            task_id = %tid,
                            age_secs = (now - claimed_at) as i64,
                            "recovered stale claimed task"
                        );
                    }
                }
                TaskStatus::Review => {
                    let review_at = t
                        .review_submitted_at
                        .or(t.claimed_at)
                        .unwrap_or(0.0);
                    if review_at > 0.0 && (now - review_at) > REVIEW_TIMEOUT_SECS {
                        // No critique arrived; keep the submitted result.
                        t.status = TaskStatus::Completed;
                        t.completed_at = Some(now_ts());
                        t.evolution_flags
                            .push("timeout_recovered:review".to_string());
                        recovered.push(tid.clone());
                        changed = true;
                        tracing::warn!(
                            task_id = %tid,
                            age_secs = (now - review_at) as i64,
                            "recovered stale review task"
                        );
                    }
                }
                TaskStatus::Critique => {
                    let critique_ts = t.critique.as_ref().map(|c| c.ts).unwrap_or(0.0);
                    if critique_ts > 0.0 && (now - critique_ts) > CLAIMED_TIMEOUT_SECS {
                        // The executor never picked up the revision.
                        t.status = TaskStatus::Completed;
                        t.completed_at = Some(now_ts());
                        t.evolution_flags
                            .push("timeout_recovered:critique".to_string());
                        recovered.push(tid.clone());
                        changed = true;
                        tracing::warn!(task_id = %tid, "recovered stale critique task");
                    }
                }
                _ => {}
            }
        }

        if changed {
            self.write(&data)?;
        }
        Ok(recovered)
    }

    // ── Query ───────────────────────────────────────────────────────────

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.read().remove(task_id)
    }

    /// All tasks in creation order. Lock-free snapshot; accepts races.
    pub fn all(&self) -> Vec<Task> {
        let data = self.read();
        let mut tasks: Vec<Task> = data.into_values().collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .partial_cmp(&b.created_at)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        tasks
    }

    pub fn list_by_agent(&self, agent_id: &str) -> Vec<Task> {
        self.all()
            .into_iter()
            .filter(|t| t.agent_id.as_deref() == Some(agent_id))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Any task still in an active (non-quiescent) state?
    pub fn has_active_tasks(&self) -> bool {
        self.read().values().any(|t| t.status.is_active())
    }

    /// Recent tasks touched by an agent, newest first.
    pub fn history(&self, agent_id: &str, last: usize) -> Vec<Task> {
        let mut tasks = self.list_by_agent(agent_id);
        tasks.sort_by(|a, b| {
            b.created_at
                .partial_cmp(&a.created_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        tasks.truncate(last);
        tasks
    }

    // ── Result collection ───────────────────────────────────────────────

    /// Collect all completed results for a task tree.
    ///
    /// Prefers non-planner outputs (the actual implementation), each
    /// prefixed by an attribution comment; falls back to the planner's own
    /// result, then the root task's.
    pub fn collect_results(&self, root_task_id: &str) -> String {
        let tasks = self.all();
        let mut planner_result: Option<String> = None;
        let mut parts: Vec<String> = Vec::new();

        for t in &tasks {
            let Some(result) = &t.result else { continue };
            // Reviewer tickets carry critique JSON, not user-facing output.
            if t.description.starts_with(crate::protocols::REVIEW_MARKER) {
                continue;
            }
            let agent = t.agent_id.as_deref().unwrap_or("");
            if is_planner_agent(agent) {
                planner_result = Some(result.clone());
            } else {
                let prefix: String = t.task_id.chars().take(8).collect();
                parts.push(format!("<!-- agent:{agent} task:{prefix} -->\n{result}"));
            }
        }

        if !parts.is_empty() {
            return parts.join("\n\n---\n\n");
        }
        if let Some(r) = planner_result {
            return r;
        }
        self.get(root_task_id)
            .and_then(|t| t.result)
            .unwrap_or_default()
    }

    /// Collect executor results AND reviewer critiques for planner
    /// close-out. Returns `(results_markdown, critiques_markdown)`.
    pub fn collect_results_with_critiques(
        &self,
        _root_task_id: &str,
        subtask_ids: Option<&[String]>,
    ) -> (String, String) {
        let tasks = self.all();
        let mut results_parts: Vec<String> = Vec::new();
        let mut critique_parts: Vec<String> = Vec::new();

        let selected: Vec<&Task> = match subtask_ids {
            Some(ids) if !ids.is_empty() => tasks
                .iter()
                .filter(|t| ids.contains(&t.task_id))
                .collect(),
            _ => tasks.iter().collect(),
        };

        for t in selected {
            let Some(result) = &t.result else { continue };
            if t.description.starts_with(crate::protocols::REVIEW_MARKER) {
                continue;
            }
            let agent = t.agent_id.as_deref().unwrap_or("");
            // Skip the planner's own decomposition output.
            if is_planner_agent(agent) {
                continue;
            }
            let desc: String = t.description.chars().take(100).collect();
            results_parts.push(format!(
                "### Subtask: {desc}\n**Agent:** {agent}\n\n{result}"
            ));

            if let Some(c) = &t.critique {
                let mut entry = format!(
                    "### Subtask: {desc}\n**Score:** {}/10 | **Reviewer:** {}\n",
                    c.score, c.reviewer
                );
                if !c.comment.is_empty() {
                    entry.push_str(&format!("**Comment:** {}\n", c.comment));
                }
                if !c.suggestions.is_empty() {
                    entry.push_str("**Suggestions:**\n");
                    for s in &c.suggestions {
                        entry.push_str(&format!("- {s}\n"));
                    }
                }
                critique_parts.push(entry);
            }
        }

        let results_text = if results_parts.is_empty() {
            "(no executor results)".to_string()
        } else {
            results_parts.join("\n\n---\n\n")
        };
        let critique_text = if critique_parts.is_empty() {
            "(no reviewer feedback)".to_string()
        } else {
            critique_parts.join("\n\n")
        };
        (results_text, critique_text)
    }

    /// Remove all tasks. With `force=false`, refuses (returns -1) while any
    /// task is still active.
    pub fn clear(&self, force: bool) -> Result<i64> {
        let _guard = LockGuard::acquire(&self.lock_path);
        let data = self.read();
        if !force {
            let active = data.values().filter(|t| t.status.is_active()).count();
            if active > 0 {
                return Ok(-1);
            }
        }
        let count = data.len() as i64;
        self.write(&BoardData::new())?;
        Ok(count)
    }

    // ── Internal ────────────────────────────────────────────────────────

    fn read(&self) -> BoardData {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "board document corrupt; starting from empty"
                    );
                    BoardData::new()
                }
            },
            Err(_) => BoardData::new(),
        }
    }

    fn write(&self, data: &BoardData) -> Result<()> {
        let raw = serde_json::to_string_pretty(data)?;
        std::fs::write(&self.path, raw).map_err(|source| BoardError::Io {
            path: self.path.clone(),
            source,
        })
    }

    #[cfg(test)]
    fn mutate_raw(&self, f: impl FnOnce(&mut BoardData)) {
        let _guard = LockGuard::acquire(&self.lock_path);
        let mut data = self.read();
        f(&mut data);
        self.write(&data).unwrap();
    }
}

/// Planner-style agents: their output is the decomposition, not a result.
fn is_planner_agent(agent_id: &str) -> bool {
    let aid = agent_id.to_lowercase();
    aid == "leo" || aid.contains("planner")
}

/// Task ids in creation order.
fn ordered_ids(data: &BoardData) -> Vec<String> {
    let mut ids: Vec<&Task> = data.values().collect();
    ids.sort_by(|a, b| {
        a.created_at
            .partial_cmp(&b.created_at)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
    ids.into_iter().map(|t| t.task_id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_board() -> (tempfile::TempDir, TaskBoard) {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::new(dir.path());
        let board = TaskBoard::new(&workdir);
        (dir, board)
    }

    // ── Basic lifecycle ─────────────────────────────────────────────────

    #[test]
    fn test_create_and_claim() {
        let (_dir, board) = test_board();
        let task = board.create_simple("test task").unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.task_id.is_empty());

        let claimed = board.claim_next("jerry", 100, None).unwrap().unwrap();
        assert_eq!(claimed.task_id, task.task_id);
        assert_eq!(claimed.status, TaskStatus::Claimed);
        assert_eq!(claimed.agent_id.as_deref(), Some("jerry"));
        assert!(claimed.claimed_at.is_some());
    }

    #[test]
    fn test_claim_returns_none_when_empty() {
        let (_dir, board) = test_board();
        assert!(board.claim_next("jerry", 100, None).unwrap().is_none());
    }

    #[test]
    fn test_submit_review_complete() {
        let (_dir, board) = test_board();
        let task = board.create_simple("test task").unwrap();
        board.claim_next("jerry", 100, None).unwrap();

        board.submit_for_review(&task.task_id, "result text").unwrap();
        let t = board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Review);
        assert_eq!(t.result.as_deref(), Some("result text"));
        assert!(t.review_submitted_at.is_some());

        board.add_review(&task.task_id, "alic", 80, "good").unwrap();
        let completed = board.complete(&task.task_id).unwrap().unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert!(completed.completed_at.is_some());
    }

    #[test]
    fn test_complete_ignores_low_scores() {
        let (_dir, board) = test_board();
        let task = board.create_simple("test task").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        board.submit_for_review(&task.task_id, "result").unwrap();
        board.add_review(&task.task_id, "alic", 30, "bad").unwrap();

        let done = board.complete(&task.task_id).unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[test]
    fn test_fail_task() {
        let (_dir, board) = test_board();
        let task = board.create_simple("test task").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        board.fail(&task.task_id, "some error").unwrap();
        let t = board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t.evolution_flags.contains(&"failed:some error".to_string()));
    }

    #[test]
    fn test_role_based_routing() {
        let (_dir, board) = test_board();
        board
            .create("review code".to_string(), vec![], 0, Some("review".into()), None)
            .unwrap();
        // jerry (executor) must not match the review role.
        assert!(board
            .claim_next("jerry", 100, Some("Implementation agent"))
            .unwrap()
            .is_none());
        // alic (reviewer) matches.
        assert!(board
            .claim_next("alic", 100, Some("Peer reviewer"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_restricted_agent_skips_generic_tasks() {
        let (_dir, board) = test_board();
        board.create_simple("generic work").unwrap();
        assert!(board.claim_next("alic", 100, None).unwrap().is_none());
        assert!(board.claim_next("jerry", 100, None).unwrap().is_some());
    }

    // ── Missing-id safety ───────────────────────────────────────────────

    #[test]
    fn test_operations_on_unknown_id_are_noops() {
        let (_dir, board) = test_board();
        board.submit_for_review("nonexistent", "result").unwrap();
        board.add_review("nonexistent", "alic", 80, "ok").unwrap();
        assert!(board.complete("nonexistent").unwrap().is_none());
        board.fail("nonexistent", "error").unwrap();
        board.flag("nonexistent", "tag").unwrap();
        board.update_partial("nonexistent", "text").unwrap();
        board.set_cost("nonexistent", 0.1).unwrap();
        assert!(!board.cancel("nonexistent").unwrap());
        assert!(!board.pause("nonexistent").unwrap());
        assert!(!board.resume("nonexistent").unwrap());
        assert!(!board.retry("nonexistent").unwrap());
        board.add_critique("nonexistent", "alic", true, vec![], "ok", 7).unwrap();
    }

    // ── Cancel / pause / retry ──────────────────────────────────────────

    #[test]
    fn test_cancel_pending_and_claimed() {
        let (_dir, board) = test_board();
        let t1 = board.create_simple("one").unwrap();
        assert!(board.cancel(&t1.task_id).unwrap());
        let t = board.get(&t1.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Cancelled);
        assert!(t.evolution_flags.contains(&"user_cancelled".to_string()));

        let t2 = board.create_simple("two").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        assert!(board.cancel(&t2.task_id).unwrap());
    }

    #[test]
    fn test_cancel_terminal_returns_false() {
        let (_dir, board) = test_board();
        let task = board.create_simple("x").unwrap();
        board.complete(&task.task_id).unwrap();
        assert!(!board.cancel(&task.task_id).unwrap());
    }

    #[test]
    fn test_pause_resume_roundtrip() {
        let (_dir, board) = test_board();
        let task = board.create_simple("x").unwrap();
        board.claim_next("jerry", 100, None).unwrap();

        assert!(board.pause(&task.task_id).unwrap());
        let t = board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Paused);
        assert_eq!(t.paused_from.as_deref(), Some("claimed"));

        assert!(board.resume(&task.task_id).unwrap());
        let t = board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.agent_id.is_none());
        assert!(t.claimed_at.is_none());
        assert!(t.paused_from.is_none());
    }

    #[test]
    fn test_pause_rejects_terminal_and_review() {
        let (_dir, board) = test_board();
        let task = board.create_simple("x").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        board.submit_for_review(&task.task_id, "r").unwrap();
        assert!(!board.pause(&task.task_id).unwrap());
    }

    #[test]
    fn test_retry_resets_and_counts() {
        let (_dir, board) = test_board();
        let task = board.create_simple("x").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        board.fail(&task.task_id, "boom").unwrap();

        assert!(board.retry(&task.task_id).unwrap());
        let t = board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.agent_id.is_none());
        assert!(t.result.is_none());
        assert!(t.claimed_at.is_none());
        assert!(t.completed_at.is_none());
        assert_eq!(t.retry_count, 1);
    }

    #[test]
    fn test_cancel_then_retry_law() {
        let (_dir, board) = test_board();
        let task = board.create_simple("x").unwrap();
        assert!(board.cancel(&task.task_id).unwrap());
        assert!(board.retry(&task.task_id).unwrap());
        let t = board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 1);
    }

    #[test]
    fn test_retry_rejects_non_terminal() {
        let (_dir, board) = test_board();
        let task = board.create_simple("x").unwrap();
        assert!(!board.retry(&task.task_id).unwrap());
    }

    #[test]
    fn test_cancel_all() {
        let (_dir, board) = test_board();
        board.create_simple("a").unwrap();
        board.create_simple("b").unwrap();
        let done = board.create_simple("c").unwrap();
        board.complete(&done.task_id).unwrap();

        assert_eq!(board.cancel_all().unwrap(), 2);
        assert_eq!(board.cancel_all().unwrap(), 0);
    }

    // ── Dependencies ────────────────────────────────────────────────────

    #[test]
    fn test_blocked_by_gates_claim() {
        let (_dir, board) = test_board();
        let dep = board.create_simple("dependency").unwrap();
        let blocked = board
            .create("blocked".to_string(), vec![dep.task_id.clone()], 0, None, None)
            .unwrap();

        // First claim gets the dependency, not the blocked task.
        let first = board.claim_next("jerry", 100, None).unwrap().unwrap();
        assert_eq!(first.task_id, dep.task_id);
        assert!(board.claim_next("jerry", 100, None).unwrap().is_none());

        board.complete(&dep.task_id).unwrap();
        let second = board.claim_next("jerry", 100, None).unwrap().unwrap();
        assert_eq!(second.task_id, blocked.task_id);
    }

    #[test]
    fn test_phantom_blocker_never_claims() {
        let (_dir, board) = test_board();
        board
            .create("forever blocked".to_string(), vec!["no-such-id".into()], 0, None, None)
            .unwrap();
        assert!(board.claim_next("jerry", 100, None).unwrap().is_none());
    }

    #[test]
    fn test_min_reputation_gate() {
        let (_dir, board) = test_board();
        board.create("hard".to_string(), vec![], 80, None, None).unwrap();
        assert!(board.claim_next("jerry", 50, None).unwrap().is_none());
        assert!(board.claim_next("jerry", 90, None).unwrap().is_some());
    }

    #[test]
    fn test_empty_description_accepted() {
        let (_dir, board) = test_board();
        let task = board.create_simple("").unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    // ── Critique flow ───────────────────────────────────────────────────

    #[test]
    fn test_critique_passed_completes() {
        let (_dir, board) = test_board();
        let task = board.create_simple("test task").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        board.submit_for_review(&task.task_id, "good result").unwrap();

        board
            .add_critique(&task.task_id, "alic", true, vec![], "looks great", 9)
            .unwrap();
        let t = board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.completed_at.is_some());
        let c = t.critique.unwrap();
        assert!(c.passed);
        assert_eq!(c.reviewer, "alic");
        assert_eq!(c.comment, "looks great");
    }

    #[test]
    fn test_critique_rejected_enters_critique_state() {
        let (_dir, board) = test_board();
        let task = board.create_simple("test task").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        board.submit_for_review(&task.task_id, "mediocre result").unwrap();

        board
            .add_critique(
                &task.task_id,
                "alic",
                false,
                vec!["fix bug in line 5".into(), "add error handling".into()],
                "needs work",
                4,
            )
            .unwrap();
        let t = board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Critique);
        assert_eq!(t.critique_round, 1);
        let c = t.critique.unwrap();
        assert!(!c.passed);
        assert_eq!(c.suggestions.len(), 2);
    }

    #[test]
    fn test_critique_flow_full() {
        let (_dir, board) = test_board();
        let task = board.create_simple("test task").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        board.submit_for_review(&task.task_id, "initial result").unwrap();

        board
            .add_critique(&task.task_id, "alic", false, vec!["fix X".into()], "not good enough", 4)
            .unwrap();
        assert_eq!(board.get(&task.task_id).unwrap().status, TaskStatus::Critique);

        let critique_task = board.claim_critique("jerry").unwrap().unwrap();
        assert_eq!(critique_task.task_id, task.task_id);
        assert_eq!(critique_task.status, TaskStatus::Claimed);

        board.submit_for_review(&task.task_id, "fixed result").unwrap();
        board.complete(&task.task_id).unwrap();
        let t = board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.result.as_deref(), Some("fixed result"));
    }

    #[test]
    fn test_claim_critique_only_original_executor() {
        let (_dir, board) = test_board();
        let task = board.create_simple("test task").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        board.submit_for_review(&task.task_id, "result").unwrap();
        board
            .add_critique(&task.task_id, "alic", false, vec!["fix it".into()], "bad", 3)
            .unwrap();

        assert!(board.claim_critique("leo").unwrap().is_none());
        assert!(board.claim_critique("jerry").unwrap().is_some());
    }

    #[test]
    fn test_second_critique_always_completes() {
        let (_dir, board) = test_board();
        let task = board.create_simple("test task").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        board.submit_for_review(&task.task_id, "initial").unwrap();

        board
            .add_critique(&task.task_id, "alic", false, vec!["fix A".into()], "round 1", 4)
            .unwrap();
        assert_eq!(board.get(&task.task_id).unwrap().critique_round, 1);

        board.claim_critique("jerry").unwrap();
        board.submit_for_review(&task.task_id, "revised").unwrap();

        // Even a second rejection completes; the reviewer is an advisor.
        board
            .add_critique(&task.task_id, "alic", false, vec!["still off".into()], "round 2", 5)
            .unwrap();
        assert_eq!(board.get(&task.task_id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_claim_critique_none_available() {
        let (_dir, board) = test_board();
        assert!(board.claim_critique("jerry").unwrap().is_none());
    }

    // ── Timeout recovery ────────────────────────────────────────────────

    #[test]
    fn test_recover_stale_claimed() {
        let (_dir, board) = test_board();
        let task = board.create_simple("x").unwrap();
        board.claim_next("jerry", 100, None).unwrap();

        board.mutate_raw(|data| {
            data.get_mut(&task.task_id).unwrap().claimed_at =
                Some(now_ts() - CLAIMED_TIMEOUT_SECS - 10.0);
        });

        let recovered = board.recover_stale_tasks().unwrap();
        assert!(recovered.contains(&task.task_id));
        let t = board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.agent_id.is_none());
        assert_eq!(t.retry_count, 1);
        assert!(t
            .evolution_flags
            .contains(&"timeout_recovered:claimed".to_string()));
    }

    #[test]
    fn test_recover_stale_review_keeps_result() {
        let (_dir, board) = test_board();
        let task = board.create_simple("x").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        board.submit_for_review(&task.task_id, "submitted output").unwrap();

        board.mutate_raw(|data| {
            data.get_mut(&task.task_id).unwrap().review_submitted_at =
                Some(now_ts() - REVIEW_TIMEOUT_SECS - 10.0);
        });

        let recovered = board.recover_stale_tasks().unwrap();
        assert!(recovered.contains(&task.task_id));
        let t = board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.result.as_deref(), Some("submitted output"));
        assert!(t
            .evolution_flags
            .contains(&"timeout_recovered:review".to_string()));
    }

    #[test]
    fn test_recover_stale_critique() {
        let (_dir, board) = test_board();
        let task = board.create_simple("x").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        board.submit_for_review(&task.task_id, "result").unwrap();
        board
            .add_critique(&task.task_id, "alic", false, vec!["fix it".into()], "bad", 3)
            .unwrap();

        board.mutate_raw(|data| {
            let t = data.get_mut(&task.task_id).unwrap();
            t.critique.as_mut().unwrap().ts = now_ts() - CLAIMED_TIMEOUT_SECS - 10.0;
        });

        let recovered = board.recover_stale_tasks().unwrap();
        assert!(recovered.contains(&task.task_id));
        let t = board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t
            .evolution_flags
            .contains(&"timeout_recovered:critique".to_string()));
    }

    #[test]
    fn test_fresh_claim_not_recovered() {
        let (_dir, board) = test_board();
        board.create_simple("x").unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        assert!(board.recover_stale_tasks().unwrap().is_empty());
    }

    // ── Result collection ───────────────────────────────────────────────

    #[test]
    fn test_collect_results_prefers_executors() {
        let (_dir, board) = test_board();
        let root = board.create_simple("root").unwrap();
        let sub = board
            .create("subtask".to_string(), vec![], 0, None, Some(root.task_id.clone()))
            .unwrap();
        board.claim_next("jerry", 100, None).unwrap();
        board.submit_for_review(&root.task_id, "planner decomposition").unwrap();
        board.mutate_raw(|data| {
            data.get_mut(&root.task_id).unwrap().agent_id = Some("leo".into());
        });
        board.submit_for_review(&sub.task_id, "executor output").unwrap();
        board.mutate_raw(|data| {
            data.get_mut(&sub.task_id).unwrap().agent_id = Some("jerry".into());
        });

        let collected = board.collect_results(&root.task_id);
        assert!(collected.contains("executor output"));
        assert!(collected.contains("<!-- agent:jerry task:"));
        assert!(!collected.contains("planner decomposition"));
    }

    #[test]
    fn test_collect_results_falls_back_to_planner() {
        let (_dir, board) = test_board();
        let root = board.create_simple("root").unwrap();
        board.submit_for_review(&root.task_id, "direct answer").unwrap();
        board.mutate_raw(|data| {
            data.get_mut(&root.task_id).unwrap().agent_id = Some("leo".into());
        });
        assert_eq!(board.collect_results(&root.task_id), "direct answer");
    }

    #[test]
    fn test_collect_results_empty() {
        let (_dir, board) = test_board();
        let root = board.create_simple("root").unwrap();
        assert_eq!(board.collect_results(&root.task_id), "");
    }

    #[test]
    fn test_collect_with_critiques() {
        let (_dir, board) = test_board();
        let root = board.create_simple("root").unwrap();
        let sub = board.create_simple("write a report").unwrap();
        board.mutate_raw(|data| {
            let t = data.get_mut(&sub.task_id).unwrap();
            t.agent_id = Some("jerry".into());
            t.result = Some("the report".into());
            t.critique = Some(CritiqueRecord {
                reviewer: "alic".into(),
                passed: true,
                score: 8,
                suggestions: vec!["tighten intro".into()],
                comment: "solid".into(),
                ts: now_ts(),
            });
        });

        let (results, critiques) = board.collect_results_with_critiques(
            &root.task_id,
            Some(&[sub.task_id.clone()]),
        );
        assert!(results.contains("the report"));
        assert!(results.contains("**Agent:** jerry"));
        assert!(critiques.contains("**Score:** 8/10"));
        assert!(critiques.contains("tighten intro"));
    }

    // ── Clear ───────────────────────────────────────────────────────────

    #[test]
    fn test_clear_refuses_active_without_force() {
        let (_dir, board) = test_board();
        board.create_simple("active").unwrap();
        assert_eq!(board.clear(false).unwrap(), -1);
        assert_eq!(board.clear(true).unwrap(), 1);
        assert!(board.all().is_empty());
    }

    #[test]
    fn test_clear_terminal_without_force() {
        let (_dir, board) = test_board();
        let t = board.create_simple("done").unwrap();
        board.complete(&t.task_id).unwrap();
        assert_eq!(board.clear(false).unwrap(), 1);
    }

    // ── Concurrency ─────────────────────────────────────────────────────

    #[test]
    fn test_no_double_claim_across_threads() {
        let (_dir, board) = test_board();
        for i in 0..4 {
            board.create_simple(format!("task {i}")).unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..8 {
            let b = board.clone();
            handles.push(std::thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Some(t) = b.claim_next(&format!("jerry-{i}"), 100, None).unwrap() {
                    claimed.push(t.task_id);
                }
                claimed
            }));
        }

        let mut all_claimed: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all_claimed.sort();
        all_claimed.dedup();
        // Exactly 4 distinct claims across 8 workers.
        assert_eq!(all_claimed.len(), 4);
    }

    #[test]
    fn test_corrupt_board_file_resets_empty() {
        let (_dir, board) = test_board();
        std::fs::write(&board.path, "{ not json").unwrap();
        assert!(board.claim_next("jerry", 100, None).unwrap().is_none());
        board.create_simple("fresh").unwrap();
        assert_eq!(board.all().len(), 1);
    }
}

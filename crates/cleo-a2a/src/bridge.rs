//! A2A ↔ TaskBoard bidirectional mapping.
//!
//! Inbound `message/send` becomes a planner-typed board task; outbound,
//! board state and results map back to A2A task status and artifacts.
//! The a2a_id ↔ cleo_id pairing is persisted in `.a2a_task_map.json` so
//! external callers can poll across restarts. The bridge treats A2A as
//! just another channel; the planner/executor/reviewer pipeline never
//! sees it.

use std::collections::BTreeMap;
use std::sync::Mutex;

use base64::Engine as _;
use serde_json::Value;

use cleo::board::TaskBoard;
use cleo::heartbeat::read_heartbeat;
use cleo::workdir::Workdir;

use crate::types::{
    new_context_id, new_task_id, A2AArtifact, A2AMessage, A2APart, A2AState, A2ATask,
    A2ATaskStatus,
};

/// Terminal wait-loop poll cadence.
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 2.0;

pub struct A2ABridge {
    workdir: Workdir,
    board: TaskBoard,
    map: Mutex<TaskMap>,
}

#[derive(Default)]
struct TaskMap {
    /// a2a_id → cleo_id.
    forward: BTreeMap<String, String>,
    /// cleo_id → a2a_id.
    reverse: BTreeMap<String, String>,
}

impl A2ABridge {
    pub fn new(workdir: Workdir) -> Self {
        let board = TaskBoard::new(&workdir);
        let map = Mutex::new(load_map(&workdir));
        Self {
            workdir,
            board,
            map,
        }
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    // ── Inbound: A2A → board ────────────────────────────────────────────

    /// Convert a `message/send` into a board task and return the
    /// submitted A2A task.
    pub fn inbound_message(&self, params: &Value, context_id: &str) -> Result<A2ATask, String> {
        let message_value = params.get("message").unwrap_or(params);
        let mut msg: A2AMessage = serde_json::from_value(message_value.clone())
            .map_err(|e| format!("invalid message: {e}"))?;
        msg.ensure_id();

        // Text parts concatenate into the task description.
        let mut text = msg.get_text();

        // File parts land in the workspace; the description references
        // them so executors can pick them up.
        for part in msg.get_files() {
            if let Some(path) = self.save_file_part(part) {
                text.push_str(&format!("\n[附件: {path}]"));
            }
        }

        let ctx_id = if context_id.is_empty() {
            new_context_id()
        } else {
            context_id.to_string()
        };

        // The board has no metadata field; the source marker rides in the
        // description.
        let tagged = format!("[A2A source: {ctx_id}] {text}");
        let cleo_task = self
            .board
            .create(tagged, Vec::new(), 0, Some("planner".to_string()), None)
            .map_err(|e| e.to_string())?;

        let a2a_id = new_task_id();
        self.register_mapping(&a2a_id, &cleo_task.task_id);
        tracing::info!(
            a2a_id = %a2a_id,
            cleo_id = %cleo_task.task_id,
            text_len = text.len(),
            "inbound A2A task"
        );

        Ok(A2ATask {
            id: a2a_id,
            context_id: ctx_id,
            status: A2ATaskStatus::new(A2AState::Submitted),
            artifacts: Vec::new(),
            history: vec![msg],
            metadata: Some(serde_json::json!({"cleo_task_id": cleo_task.task_id})),
            kind: "task".to_string(),
        })
    }

    fn save_file_part(&self, part: &A2APart) -> Option<String> {
        let A2APart::File {
            name, data, uri, ..
        } = part
        else {
            return None;
        };

        // URI-only parts are recorded verbatim.
        if data.is_none() {
            return uri.clone();
        }

        let dir = self.workdir.workspace().join("a2a");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(error = %e, "a2a attachment dir create failed");
            return None;
        }
        let filename = if name.is_empty() {
            let suffix: String = new_task_id().chars().skip(4).collect();
            format!("attachment_{suffix}")
        } else {
            // Basename only; the sender does not choose our directories.
            name.rsplit(['/', '\\']).next().unwrap_or(name).to_string()
        };
        let path = dir.join(&filename);
        let raw = match base64::engine::general_purpose::STANDARD.decode(data.as_deref()?) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "attachment base64 decode failed");
                return None;
            }
        };
        match std::fs::write(&path, &raw) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), bytes = raw.len(), "saved attachment");
                Some(path.display().to_string())
            }
            Err(e) => {
                tracing::warn!(error = %e, "attachment write failed");
                None
            }
        }
    }

    // ── Outbound: board → A2A ───────────────────────────────────────────

    /// A completed task's result as artifacts.
    pub fn outbound_result(&self, cleo_id: &str) -> Vec<A2AArtifact> {
        let Some(task) = self.board.get(cleo_id) else {
            return Vec::new();
        };
        match task.result {
            Some(result) if !result.is_empty() => vec![A2AArtifact::text(
                "result",
                "Task execution result",
                result,
            )],
            _ => Vec::new(),
        }
    }

    /// Current A2A view of a task: status mapped from the board, progress
    /// message from the holder's heartbeat while working, artifacts when
    /// complete.
    pub fn get_task_status(&self, a2a_id: &str) -> A2ATask {
        let Some(cleo_id) = self.cleo_id_for(a2a_id) else {
            return A2ATask::failed(a2a_id, "Task not found");
        };
        let Some(task) = self.board.get(&cleo_id) else {
            return A2ATask::failed(a2a_id, "Cleo task not found");
        };

        let state = A2AState::from_board_status(task.status);
        let status = if state == A2AState::Working {
            match self.heartbeat_progress(task.agent_id.as_deref()) {
                Some(progress) => A2ATaskStatus::with_message(
                    state,
                    A2AMessage::agent(vec![A2APart::text_part(progress)]),
                ),
                None => A2ATaskStatus::new(state),
            }
        } else {
            A2ATaskStatus::new(state)
        };

        let artifacts = if state == A2AState::Completed {
            self.outbound_result(&cleo_id)
        } else {
            Vec::new()
        };

        A2ATask {
            id: a2a_id.to_string(),
            context_id: new_context_id(),
            status,
            artifacts,
            history: Vec::new(),
            metadata: None,
            kind: "task".to_string(),
        }
    }

    pub fn cancel_task(&self, a2a_id: &str) -> A2ATask {
        let Some(cleo_id) = self.cleo_id_for(a2a_id) else {
            return A2ATask::failed(a2a_id, "Task not found");
        };
        match self.board.cancel(&cleo_id) {
            Ok(cancelled) => {
                tracing::info!(a2a_id, cleo_id = %cleo_id, cancelled, "cancel via A2A");
            }
            Err(e) => tracing::warn!(error = %e, "cancel failed"),
        }
        A2ATask {
            id: a2a_id.to_string(),
            context_id: new_context_id(),
            status: A2ATaskStatus::new(A2AState::Canceled),
            artifacts: Vec::new(),
            history: Vec::new(),
            metadata: None,
            kind: "task".to_string(),
        }
    }

    /// Wait for the underlying board task to settle, polling. Used by the
    /// synchronous `message/send` variant.
    #[cfg(feature = "server")]
    pub async fn wait_for_completion(&self, a2a_id: &str, timeout_secs: f64) -> A2ATask {
        let Some(cleo_id) = self.cleo_id_for(a2a_id) else {
            return A2ATask::failed(a2a_id, "Task not found");
        };
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs_f64(timeout_secs);

        while std::time::Instant::now() < deadline {
            if let Some(task) = self.board.get(&cleo_id) {
                if task.status.is_terminal() {
                    return self.get_task_status(a2a_id);
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs_f64(DEFAULT_POLL_INTERVAL_SECS))
                .await;
        }

        tracing::warn!(a2a_id, timeout_secs, "A2A task wait timed out");
        A2ATask::failed(a2a_id, format!("Timeout after {timeout_secs}s"))
    }

    fn heartbeat_progress(&self, agent_id: Option<&str>) -> Option<String> {
        let agent_id = agent_id?;
        let hb = read_heartbeat(&self.workdir, agent_id)?;
        if hb.status.is_empty() && hb.progress.is_empty() {
            return None;
        }
        Some(if hb.progress.is_empty() {
            hb.status
        } else {
            format!("{}: {}", hb.status, hb.progress)
        })
    }

    // ── Id mapping ──────────────────────────────────────────────────────

    pub fn cleo_id_for(&self, a2a_id: &str) -> Option<String> {
        self.map
            .lock()
            .expect("task map lock")
            .forward
            .get(a2a_id)
            .cloned()
    }

    pub fn a2a_id_for(&self, cleo_id: &str) -> Option<String> {
        self.map
            .lock()
            .expect("task map lock")
            .reverse
            .get(cleo_id)
            .cloned()
    }

    fn register_mapping(&self, a2a_id: &str, cleo_id: &str) {
        let mut map = self.map.lock().expect("task map lock");
        map.forward.insert(a2a_id.to_string(), cleo_id.to_string());
        map.reverse.insert(cleo_id.to_string(), a2a_id.to_string());
        let snapshot = map.forward.clone();
        drop(map);
        save_map(&self.workdir, &snapshot);
    }
}

fn load_map(workdir: &Workdir) -> TaskMap {
    let forward: BTreeMap<String, String> = std::fs::read_to_string(workdir.a2a_task_map())
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let reverse = forward
        .iter()
        .map(|(k, v)| (v.clone(), k.clone()))
        .collect();
    TaskMap { forward, reverse }
}

fn save_map(workdir: &Workdir, forward: &BTreeMap<String, String>) {
    match serde_json::to_string_pretty(forward) {
        Ok(raw) => {
            if let Err(e) = std::fs::write(workdir.a2a_task_map(), raw) {
                tracing::warn!(error = %e, "a2a task map write failed");
            }
        }
        Err(e) => tracing::warn!(error = %e, "a2a task map serialize failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_bridge() -> (tempfile::TempDir, A2ABridge) {
        let dir = tempfile::tempdir().unwrap();
        let bridge = A2ABridge::new(Workdir::new(dir.path()));
        (dir, bridge)
    }

    fn send_params(text: &str) -> Value {
        json!({
            "message": {
                "role": "user",
                "parts": [{"kind": "text", "text": text}],
            }
        })
    }

    #[test]
    fn test_inbound_creates_planner_task() {
        let (_dir, bridge) = test_bridge();
        let task = bridge.inbound_message(&send_params("What is 2+2?"), "").unwrap();

        assert!(task.id.starts_with("a2a-"));
        assert!(task.context_id.starts_with("ctx-"));
        assert_eq!(task.status.state, A2AState::Submitted);

        let cleo_id = bridge.cleo_id_for(&task.id).unwrap();
        let cleo_task = bridge.board().get(&cleo_id).unwrap();
        assert!(cleo_task.description.starts_with("[A2A source: ctx-"));
        assert!(cleo_task.description.ends_with("What is 2+2?"));
        assert_eq!(cleo_task.required_role.as_deref(), Some("planner"));
    }

    #[test]
    fn test_mapping_is_bidirectional_and_persistent() {
        let (dir, bridge) = test_bridge();
        let task = bridge.inbound_message(&send_params("hello"), "").unwrap();
        let cleo_id = bridge.cleo_id_for(&task.id).unwrap();
        assert_eq!(bridge.a2a_id_for(&cleo_id).unwrap(), task.id);

        // A fresh bridge on the same workdir reloads the mapping.
        let bridge2 = A2ABridge::new(Workdir::new(dir.path()));
        assert_eq!(bridge2.cleo_id_for(&task.id).unwrap(), cleo_id);
        assert_eq!(bridge2.a2a_id_for(&cleo_id).unwrap(), task.id);
    }

    #[test]
    fn test_supplied_context_id_kept() {
        let (_dir, bridge) = test_bridge();
        let task = bridge
            .inbound_message(&send_params("hi"), "ctx-caller-supplied")
            .unwrap();
        assert_eq!(task.context_id, "ctx-caller-supplied");
    }

    #[test]
    fn test_inbound_file_part_saved() {
        let (dir, bridge) = test_bridge();
        let encoded = base64::engine::general_purpose::STANDARD.encode("file body");
        let params = json!({
            "message": {
                "role": "user",
                "parts": [
                    {"kind": "text", "text": "process the attachment"},
                    {"kind": "file", "name": "../sneaky/data.txt",
                     "mimeType": "text/plain", "data": encoded},
                ],
            }
        });
        let task = bridge.inbound_message(&params, "").unwrap();
        let cleo_id = bridge.cleo_id_for(&task.id).unwrap();
        let desc = bridge.board().get(&cleo_id).unwrap().description;
        assert!(desc.contains("[附件: "));

        // Basename-sanitized into the workspace.
        let saved = dir.path().join("workspace/a2a/data.txt");
        assert_eq!(std::fs::read_to_string(saved).unwrap(), "file body");
    }

    #[test]
    fn test_zero_part_message_is_fine() {
        let (_dir, bridge) = test_bridge();
        let params = json!({"message": {"role": "user", "parts": []}});
        let task = bridge.inbound_message(&params, "").unwrap();
        let cleo_id = bridge.cleo_id_for(&task.id).unwrap();
        let desc = bridge.board().get(&cleo_id).unwrap().description;
        assert!(desc.starts_with("[A2A source: "));
    }

    #[test]
    fn test_status_mapping_through_lifecycle() {
        let (_dir, bridge) = test_bridge();
        let task = bridge.inbound_message(&send_params("work"), "").unwrap();
        let cleo_id = bridge.cleo_id_for(&task.id).unwrap();

        assert_eq!(bridge.get_task_status(&task.id).status.state, A2AState::Submitted);

        bridge.board().claim_next("leo", 100, None).unwrap();
        assert_eq!(bridge.get_task_status(&task.id).status.state, A2AState::Working);

        bridge.board().submit_for_review(&cleo_id, "the answer").unwrap();
        assert_eq!(bridge.get_task_status(&task.id).status.state, A2AState::Working);

        bridge.board().complete(&cleo_id).unwrap();
        let done = bridge.get_task_status(&task.id);
        assert_eq!(done.status.state, A2AState::Completed);
        assert_eq!(done.artifacts.len(), 1);
        assert_eq!(done.artifacts[0].parts[0].as_text(), Some("the answer"));
    }

    #[test]
    fn test_unknown_id_fails_gracefully() {
        let (_dir, bridge) = test_bridge();
        let status = bridge.get_task_status("a2a-missing");
        assert_eq!(status.status.state, A2AState::Failed);
        let cancelled = bridge.cancel_task("a2a-missing");
        assert_eq!(cancelled.status.state, A2AState::Failed);
    }

    #[test]
    fn test_cancel_maps_to_board_cancel() {
        let (_dir, bridge) = test_bridge();
        let task = bridge.inbound_message(&send_params("stop me"), "").unwrap();
        let cleo_id = bridge.cleo_id_for(&task.id).unwrap();

        let result = bridge.cancel_task(&task.id);
        assert_eq!(result.status.state, A2AState::Canceled);
        let board_task = bridge.board().get(&cleo_id).unwrap();
        assert_eq!(board_task.status, cleo::board::TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_for_completion_returns_terminal() {
        let (_dir, bridge) = test_bridge();
        let task = bridge.inbound_message(&send_params("quick"), "").unwrap();
        let cleo_id = bridge.cleo_id_for(&task.id).unwrap();
        bridge.board().submit_for_review(&cleo_id, "done").unwrap();
        bridge.board().complete(&cleo_id).unwrap();

        let done = bridge.wait_for_completion(&task.id, 5.0).await;
        assert_eq!(done.status.state, A2AState::Completed);
    }
}

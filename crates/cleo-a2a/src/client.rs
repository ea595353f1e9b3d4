//! Outbound A2A client.
//!
//! Used by executor workers when a subtask carries the `a2a_delegate`
//! hint: resolve the target through the registry, sanitize the outbound
//! message at the target's trust level, submit over JSON-RPC, poll
//! adaptively to a terminal state, and validate whatever comes back.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use cleo::config::A2aClientConfig;
use cleo::worker::A2aDelegator;
use cleo::workdir::Workdir;

use crate::jsonrpc::{methods, JsonRpcRequest};
use crate::registry::{AgentEntry, AgentRegistry};
use crate::security::SecurityFilter;
use crate::types::new_message_id;

/// Inline attachment cap, matching the server-side body budget.
pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;
/// Cap on the initial submit round-trip.
const SUBMIT_TIMEOUT_SECS: f64 = 30.0;

/// Result of delegating a task to an external agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegationResult {
    /// completed / failed / timeout / blocked / canceled.
    pub status: String,
    pub text: String,
    pub files: Vec<String>,
    /// Input-required rounds observed while polling.
    pub rounds: u32,
    pub agent_url: String,
    pub agent_name: String,
    pub trust_level: String,
    pub duration: f64,
    pub error: String,
    pub warnings: Vec<String>,
}

impl DelegationResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: "failed".to_string(),
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"status": "failed"}))
    }
}

pub struct A2AClient {
    enabled: bool,
    workdir: Workdir,
    registry: AgentRegistry,
    security: SecurityFilter,
    http: reqwest::Client,
}

impl A2AClient {
    pub fn new(workdir: Workdir, config: A2aClientConfig) -> Self {
        let security = SecurityFilter::new(&config.security);
        let enabled = config.enabled;
        let registry = AgentRegistry::new(config);
        tracing::info!(enabled, "A2A client initialized");
        Self {
            enabled,
            workdir,
            registry,
            security,
            http: reqwest::Client::new(),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn security(&self) -> &SecurityFilter {
        &self.security
    }

    /// Send a task to an external agent and wait for its result.
    pub async fn send_task(
        &self,
        agent_url: &str,
        message: &str,
        files: &[PathBuf],
        required_skills: &[String],
        timeout_secs: f64,
    ) -> DelegationResult {
        if !self.enabled {
            return DelegationResult::failed(
                "A2A client is disabled. Set a2a.client.enabled=true.",
            );
        }

        let started = Instant::now();
        let timeout_secs = timeout_secs.min(self.security.max_timeout());

        let Some(entry) = self.registry.resolve(agent_url, required_skills) else {
            return DelegationResult {
                duration: started.elapsed().as_secs_f64(),
                ..DelegationResult::failed(format!(
                    "No agent found for url={agent_url}, skills={required_skills:?}"
                ))
            };
        };
        let trust = entry.trust_level.clone();

        let clean_message = self.security.sanitize_outbound(message, &trust);

        let mut parts = vec![json!({"kind": "text", "text": clean_message})];
        if !files.is_empty() {
            if self.security.can_send_files(&trust) {
                for path in files {
                    if let Some(part) = encode_file(path) {
                        parts.push(part);
                    }
                }
            } else {
                tracing::info!(trust = %trust, "files withheld at this trust level");
            }
        }

        let request = JsonRpcRequest::new(
            methods::SEND_MESSAGE,
            json!(format!("cleo-{}", rpc_id_suffix())),
            Some(json!({
                "message": {
                    "role": "user",
                    "parts": parts,
                    "messageId": new_message_id(),
                },
            })),
        );

        tracing::info!(
            agent = %entry.name,
            url = %entry.url,
            trust = %trust,
            msg_len = clean_message.len(),
            "sending A2A task"
        );

        let response = match self
            .http_post(&entry, &request, timeout_secs.min(SUBMIT_TIMEOUT_SECS))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.registry.record_failure(&entry.url);
                return self.result_for(&entry, &trust, started, DelegationResult::failed(e));
            }
        };

        if let Some(error) = response.get("error") {
            self.registry.record_failure(&entry.url);
            let msg = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown RPC error");
            return self.result_for(
                &entry,
                &trust,
                started,
                DelegationResult::failed(format!("RPC error: {msg}")),
            );
        }

        let mut task = response.get("result").cloned().unwrap_or_default();
        let task_id = task.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let mut rounds = 0u32;

        if !is_terminal_state(state_of(&task)) {
            let remaining = timeout_secs - started.elapsed().as_secs_f64();
            (task, rounds) = self.poll_until_done(&entry, &task_id, remaining).await;
        }
        self.registry.record_success(&entry.url);

        // Collect text and files from the artifacts.
        let mut text = String::new();
        let mut saved_files = Vec::new();
        for artifact in task
            .get("artifacts")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
        {
            for part in artifact.get("parts").and_then(|v| v.as_array()).cloned().unwrap_or_default() {
                match part.get("kind").and_then(|v| v.as_str()) {
                    Some("text") => {
                        if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
                            text.push_str(t);
                            text.push('\n');
                        }
                    }
                    Some("file") => {
                        if let Some(path) = self.save_received_file(&part, &trust) {
                            saved_files.push(path);
                        }
                    }
                    _ => {}
                }
            }
        }

        let validation = self.security.validate_inbound(text.trim(), &trust);
        if validation.blocked {
            return self.result_for(
                &entry,
                &trust,
                started,
                DelegationResult {
                    status: "blocked".to_string(),
                    error: "Response blocked by security filter".to_string(),
                    warnings: validation.warnings,
                    rounds,
                    ..Default::default()
                },
            );
        }

        let final_state = state_of(&task).to_string();
        let status = if is_terminal_state(&final_state) {
            final_state
        } else {
            "failed".to_string()
        };
        let duration = started.elapsed().as_secs_f64();
        tracing::info!(
            task_id = %task_id,
            status = %status,
            duration_secs = duration as u64,
            files = saved_files.len(),
            "A2A task finished"
        );

        DelegationResult {
            status,
            text: validation.text,
            files: saved_files,
            rounds,
            agent_url: entry.url.clone(),
            agent_name: entry.name.clone(),
            trust_level: trust,
            duration,
            error: String::new(),
            warnings: validation.warnings,
        }
    }

    // ── Polling ─────────────────────────────────────────────────────────

    /// Poll tasks/get until terminal or timeout. Interval starts at 2 s
    /// and backs off ×1.2 to a 10 s ceiling; input-required rounds are
    /// counted and bounded by the trust tier.
    async fn poll_until_done(
        &self,
        entry: &AgentEntry,
        task_id: &str,
        remaining_secs: f64,
    ) -> (Value, u32) {
        let deadline = Instant::now() + Duration::from_secs_f64(remaining_secs.max(5.0));
        let mut interval = 2.0f64;
        let mut last = Value::Null;
        let mut rounds = 0u32;
        let max_rounds = self.security.get_max_rounds(&entry.trust_level);

        while Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;

            let request = JsonRpcRequest::new(
                methods::GET_TASK,
                json!(format!("poll-{}", rpc_id_suffix())),
                Some(json!({"id": task_id})),
            );
            let response = match self.http_post(entry, &request, 15.0).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(error = %e, "poll failed");
                    continue;
                }
            };
            if let Some(error) = response.get("error") {
                tracing::warn!(?error, "poll returned an error");
                continue;
            }

            last = response.get("result").cloned().unwrap_or_default();
            let state = state_of(&last);
            if is_terminal_state(state) {
                return (last, rounds);
            }
            if state == "input-required" {
                rounds += 1;
                if rounds > max_rounds {
                    tracing::warn!(max_rounds, task_id, "input-required round bound exceeded");
                    break;
                }
                // Auto-response is a future extension; for now keep
                // polling within the round bound.
                tracing::info!(rounds, max_rounds, "input-required round");
            }

            interval = (interval * 1.2).min(10.0);
        }

        tracing::warn!(task_id, "polling timed out");
        if last.is_null() {
            last = json!({"status": {"state": "failed"}});
        } else {
            last["status"]["state"] = json!("failed");
            last["status"]["message"] = json!({
                "role": "agent",
                "parts": [{"kind": "text", "text": "Polling timed out"}],
            });
        }
        (last, rounds)
    }

    // ── Transport ───────────────────────────────────────────────────────

    async fn http_post(
        &self,
        entry: &AgentEntry,
        request: &JsonRpcRequest,
        timeout_secs: f64,
    ) -> Result<Value, String> {
        let mut builder = self
            .http
            .post(&entry.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("User-Agent", "Cleo-A2A-Client/0.2")
            .timeout(Duration::from_secs_f64(timeout_secs))
            .json(request);
        for (name, value) in self.registry.auth_headers(&entry.url) {
            builder = builder.header(name, value);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| format!("HTTP error: {e}"))?;
        resp.json().await.map_err(|e| format!("invalid JSON response: {e}"))
    }

    // ── File handling ───────────────────────────────────────────────────

    fn save_received_file(&self, part: &Value, trust: &str) -> Option<String> {
        if !self.security.can_receive_files(trust) {
            tracing::info!(trust, "file receive blocked at this trust level");
            return None;
        }
        let dir = self.workdir.workspace().join("a2a/received");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(error = %e, "received-file dir create failed");
            return None;
        }

        let name = part
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("received_file");
        // Basename only; the remote does not choose our directories.
        let filename = name.rsplit(['/', '\\']).next().unwrap_or(name);
        let path = dir.join(filename);

        if let Some(data) = part.get("data").and_then(|v| v.as_str()) {
            let raw = match base64::engine::general_purpose::STANDARD.decode(data) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(error = %e, "received file base64 decode failed");
                    return None;
                }
            };
            if let Err(e) = std::fs::write(&path, &raw) {
                tracing::warn!(error = %e, "received file write failed");
                return None;
            }
            tracing::info!(path = %path.display(), bytes = raw.len(), "saved received file");
            return Some(path.display().to_string());
        }
        part.get("uri").and_then(|v| v.as_str()).map(|s| s.to_string())
    }

    fn result_for(
        &self,
        entry: &AgentEntry,
        trust: &str,
        started: Instant,
        mut result: DelegationResult,
    ) -> DelegationResult {
        result.agent_url = entry.url.clone();
        result.agent_name = entry.name.clone();
        result.trust_level = trust.to_string();
        result.duration = started.elapsed().as_secs_f64();
        result
    }
}

/// Encode a local file as an inline FilePart.
fn encode_file(path: &PathBuf) -> Option<Value> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "attachment read failed");
            return None;
        }
    };
    if raw.len() > MAX_FILE_BYTES {
        tracing::warn!(path = %path.display(), bytes = raw.len(), "attachment too large");
        return None;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    let mime = match path.extension().and_then(|e| e.to_str()) {
        Some("txt") | Some("md") => "text/plain",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    };
    Some(json!({
        "kind": "file",
        "name": name,
        "mimeType": mime,
        "data": base64::engine::general_purpose::STANDARD.encode(&raw),
    }))
}

fn rpc_id_suffix() -> String {
    new_message_id().chars().skip(4).collect()
}

fn state_of(task: &Value) -> &str {
    task.get("status")
        .and_then(|s| s.get("state"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn is_terminal_state(state: &str) -> bool {
    matches!(state, "completed" | "failed" | "canceled")
}

/// The worker-side delegation seam, wired by the server binary.
#[async_trait]
impl A2aDelegator for A2AClient {
    async fn delegate(
        &self,
        agent_url: &str,
        message: &str,
        required_skills: &[String],
        timeout_secs: f64,
    ) -> Value {
        self.send_task(agent_url, message, &[], required_skills, timeout_secs)
            .await
            .to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_client(dir: &tempfile::TempDir) -> A2AClient {
        A2AClient::new(Workdir::new(dir.path()), A2aClientConfig::default())
    }

    #[tokio::test]
    async fn test_disabled_client_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let client = disabled_client(&dir);
        let result = client
            .send_task("https://x.example.com", "hi", &[], &[], 10.0)
            .await;
        assert_eq!(result.status, "failed");
        assert!(result.error.contains("disabled"));
    }

    #[tokio::test]
    async fn test_auto_with_no_agents_fails() {
        let dir = tempfile::tempdir().unwrap();
        let client = A2AClient::new(
            Workdir::new(dir.path()),
            A2aClientConfig {
                enabled: true,
                ..Default::default()
            },
        );
        let result = client
            .send_task("auto", "hi", &[], &["nonexistent".to_string()], 10.0)
            .await;
        assert_eq!(result.status, "failed");
        assert!(result.error.contains("No agent found"));
    }

    #[test]
    fn test_encode_file_and_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();
        let part = encode_file(&path).unwrap();
        assert_eq!(part["kind"], "file");
        assert_eq!(part["name"], "data.csv");
        assert_eq!(part["mimeType"], "text/csv");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(part["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"a,b\n1,2\n");

        assert!(encode_file(&dir.path().join("missing.txt")).is_none());
    }

    #[test]
    fn test_state_helpers() {
        let task = json!({"status": {"state": "working"}});
        assert_eq!(state_of(&task), "working");
        assert!(!is_terminal_state("working"));
        assert!(!is_terminal_state("input-required"));
        assert!(is_terminal_state("completed"));
        assert!(is_terminal_state("canceled"));
        assert_eq!(state_of(&json!({})), "");
    }

    #[test]
    fn test_delegation_result_value_shape() {
        let result = DelegationResult {
            status: "completed".to_string(),
            text: "answer".to_string(),
            trust_level: "community".to_string(),
            ..Default::default()
        };
        let value = result.to_value();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["trust_level"], "community");
        assert_eq!(value["rounds"], 0);
    }

    #[test]
    fn test_received_file_respects_trust() {
        let dir = tempfile::tempdir().unwrap();
        let client = A2AClient::new(
            Workdir::new(dir.path()),
            A2aClientConfig {
                enabled: true,
                ..Default::default()
            },
        );
        let part = json!({
            "kind": "file",
            "name": "../escape/out.txt",
            "data": base64::engine::general_purpose::STANDARD.encode("payload"),
        });
        // Untrusted may not deliver files at all.
        assert!(client.save_received_file(&part, "untrusted").is_none());
        // Community may, basename-sanitized.
        let saved = client.save_received_file(&part, "community").unwrap();
        assert!(saved.ends_with("out.txt"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("workspace/a2a/received/out.txt")).unwrap(),
            "payload"
        );
    }
}

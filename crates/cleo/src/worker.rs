//! Per-agent worker loop.
//!
//! One OS process per agent, all running this identical driver with their
//! agent id. Each iteration: look for a critique revision first, then
//! self-claim the next eligible task, assemble the prompt, drive the model
//! (streaming partials to the board), execute fenced tool calls, and
//! submit the outcome. Planner-typed agents route, decompose, and perform
//! the close-out synthesis; reviewer-typed agents grade review tickets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::board::{Task, TaskBoard, TaskStatus};
use crate::bus::ContextBus;
use crate::config::{AgentConfig, CleoConfig};
use crate::heartbeat::write_heartbeat;
use crate::protocols::{
    strip_think, CritiqueSpec, IntentAnchor, RouteDecision, SourceTrust, SubTaskSpec,
};
use crate::provider::{ChatMessage, CompletionRequest, Provider};
use crate::router::parse_route_from_output;
use crate::skills;
use crate::textgrad;
use crate::tools::{self, ToolContext};
use crate::usage::{CallUsage, UsageError, UsageTracker};
use crate::workdir::Workdir;

pub use crate::protocols::{CLOSEOUT_MARKER, REVIEW_MARKER};

/// Tool-execution rounds per task before the loop is cut off.
const MAX_TOOL_ROUNDS: u32 = 6;

/// Outbound delegation seam; wired to the A2A client by the server binary.
#[async_trait]
pub trait A2aDelegator: Send + Sync {
    /// Returns a DelegationResult-shaped JSON value.
    async fn delegate(
        &self,
        agent_url: &str,
        message: &str,
        required_skills: &[String],
        timeout_secs: f64,
    ) -> Value;
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Exit after this many consecutive empty polls; 0 means run forever.
    pub max_idle_polls: u32,
    pub poll_floor: Duration,
    pub poll_ceiling: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_idle_polls: 0,
            poll_floor: Duration::from_millis(250),
            poll_ceiling: Duration::from_secs(2),
        }
    }
}

pub struct Worker {
    workdir: Workdir,
    config: CleoConfig,
    agent: AgentConfig,
    provider: Arc<dyn Provider>,
    delegator: Option<Arc<dyn A2aDelegator>>,
    board: TaskBoard,
    bus: ContextBus,
    tracker: UsageTracker,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        workdir: Workdir,
        config: CleoConfig,
        agent: AgentConfig,
        provider: Arc<dyn Provider>,
        options: WorkerOptions,
    ) -> Self {
        let board = TaskBoard::new(&workdir);
        let bus = ContextBus::new(&workdir);
        let tracker = UsageTracker::new(&workdir);
        Self {
            workdir,
            config,
            agent,
            provider,
            delegator: None,
            board,
            bus,
            tracker,
            options,
        }
    }

    pub fn with_delegator(mut self, delegator: Arc<dyn A2aDelegator>) -> Self {
        self.delegator = Some(delegator);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent.id
    }

    /// Main loop: poll, execute, back off. Returns when the idle bound is
    /// reached (orchestrated runs) or never (daemon mode).
    pub async fn run(&self) {
        let mut idle: u32 = 0;
        let mut backoff = self.options.poll_floor;
        loop {
            match self.poll_once().await {
                Ok(true) => {
                    idle = 0;
                    backoff = self.options.poll_floor;
                }
                Ok(false) => {
                    idle += 1;
                    if self.options.max_idle_polls > 0 && idle >= self.options.max_idle_polls {
                        tracing::info!(agent_id = %self.agent.id, "idle bound reached; worker exiting");
                        write_heartbeat(&self.workdir, &self.agent.id, "offline", "");
                        return;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.options.poll_ceiling);
                }
                Err(e) => {
                    tracing::error!(agent_id = %self.agent.id, error = %e, "worker iteration failed");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// One poll: claim and fully execute at most one task.
    /// Returns whether any work was claimed.
    pub async fn poll_once(&self) -> anyhow::Result<bool> {
        write_heartbeat(&self.workdir, &self.agent.id, "idle", "");

        // Critique revisions come first: only this agent can fix its own
        // rejected work.
        if let Some(task) = self.board.claim_critique(&self.agent.id)? {
            self.execute(task, true).await;
            return Ok(true);
        }

        let claimed = self.board.claim_next(
            &self.agent.id,
            self.agent.reputation,
            Some(&self.agent.role),
        )?;
        match claimed {
            Some(task) => {
                self.execute(task, false).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Task execution ──────────────────────────────────────────────────

    async fn execute(&self, task: Task, revision: bool) {
        let preview: String = task.description.chars().take(60).collect();
        write_heartbeat(&self.workdir, &self.agent.id, "working", &preview);
        self.bus.set_agent_status(&self.agent.id, "working");
        tracing::info!(agent_id = %self.agent.id, task_id = %task.task_id, revision, "claimed task");

        let outcome = if self.is_review_ticket(&task) {
            self.execute_review(&task).await
        } else if let Some(root_id) = task.description.strip_prefix(CLOSEOUT_MARKER) {
            let root_id = root_id.split_whitespace().next().unwrap_or("").to_string();
            self.execute_closeout(&task, &root_id).await
        } else {
            self.execute_regular(&task, revision).await
        };

        if let Err(reason) = outcome {
            tracing::warn!(task_id = %task.task_id, reason = %reason, "task failed");
            if let Err(e) = self.board.fail(&task.task_id, &reason) {
                tracing::error!(error = %e, "could not record failure");
            }
        }
        self.bus.set_agent_status(&self.agent.id, "idle");
        write_heartbeat(&self.workdir, &self.agent.id, "idle", "");
    }

    fn is_review_ticket(&self, task: &Task) -> bool {
        task.description.starts_with(REVIEW_MARKER)
    }

    fn is_planner(&self) -> bool {
        crate::board::roles::role_matches("planner", &self.agent.id)
    }

    /// Claim → model → tools → submit for a regular (executor or planner
    /// root) task.
    async fn execute_regular(&self, task: &Task, revision: bool) -> Result<(), String> {
        // A2A-hinted subtasks bypass the local model entirely.
        let spec = SubTaskSpec::from_task_description(&task.description);
        if let Some(spec) = &spec {
            if spec.tool_hint.iter().any(|h| h == "a2a_delegate") || !spec.a2a_hint.is_empty() {
                if let Some(result) = self.try_delegate(task, spec).await? {
                    self.finish_with(task, result).await?;
                    return Ok(());
                }
            }
        }

        let mut messages = vec![ChatMessage::system(self.system_prompt(task))];
        if revision {
            if let Some(c) = &task.critique {
                messages.push(ChatMessage::user(format!(
                    "Your previous result was reviewed and needs revision.\n\
                     Reviewer comment: {}\nSuggestions:\n{}\n\nPrevious result:\n{}",
                    c.comment,
                    c.suggestions
                        .iter()
                        .map(|s| format!("- {s}"))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    task.result.as_deref().unwrap_or(""),
                )));
            }
        }
        messages.push(ChatMessage::user(task.description.clone()));

        let mut final_text = self.call_model(task, messages.clone()).await?;
        messages.push(ChatMessage::assistant(final_text.clone()));

        // Tool loop: run calls, feed results back, re-invoke.
        let mut rounds = 0;
        loop {
            let calls = tools::parse_tool_calls(&final_text);
            if calls.is_empty() || rounds >= MAX_TOOL_ROUNDS {
                break;
            }
            rounds += 1;
            let results = self.run_tool_calls(task, &calls).await;
            if self.task_interrupted(&task.task_id) {
                tracing::info!(task_id = %task.task_id, "task cancelled mid-tools; aborting");
                return Ok(());
            }
            messages.push(ChatMessage::user(format!(
                "Tool results:\n{}",
                serde_json::to_string_pretty(&results).unwrap_or_default()
            )));
            final_text = self.call_model(task, messages.clone()).await?;
            messages.push(ChatMessage::assistant(final_text.clone()));
        }

        if self.task_interrupted(&task.task_id) {
            tracing::info!(task_id = %task.task_id, "task cancelled; dropping output");
            return Ok(());
        }

        let visible = strip_think(&final_text);
        if self.is_planner() && !revision {
            self.finish_planner(task, &final_text, &visible).await
        } else {
            self.board
                .submit_for_review(&task.task_id, visible)
                .map_err(|e| e.to_string())
        }
    }

    /// Planner output handling: explicit route, else decomposition.
    async fn finish_planner(&self, task: &Task, raw: &str, visible: &str) -> Result<(), String> {
        let route = parse_route_from_output(raw);

        if route == Some(RouteDecision::DirectAnswer) {
            // Strip the ROUTE line; the rest is the user-facing answer.
            let answer = visible
                .lines()
                .filter(|l| !l.trim().to_uppercase().starts_with("ROUTE:"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string();
            self.board
                .submit_for_review(&task.task_id, answer)
                .map_err(|e| e.to_string())?;
            self.board.complete(&task.task_id).map_err(|e| e.to_string())?;
            return Ok(());
        }

        let specs = parse_planner_subtasks(visible, &task.description);
        if specs.is_empty() {
            // No decomposition came back; treat the output as the answer.
            self.board
                .submit_for_review(&task.task_id, visible)
                .map_err(|e| e.to_string())?;
            self.board.complete(&task.task_id).map_err(|e| e.to_string())?;
            return Ok(());
        }

        self.refine_intent_anchor(task, visible);

        for spec in &specs {
            let required_role = infer_required_role(spec);
            if let Err(e) = self.board.create(
                spec.to_task_description(),
                Vec::new(),
                0,
                Some(required_role),
                Some(task.task_id.clone()),
            ) {
                tracing::error!(error = %e, "subtask create failed");
            }
        }
        tracing::info!(task_id = %task.task_id, subtasks = specs.len(), "planner decomposed");

        self.board
            .submit_for_review(&task.task_id, visible)
            .map_err(|e| e.to_string())?;
        self.board.complete(&task.task_id).map_err(|e| e.to_string())?;
        Ok(())
    }

    /// After decomposition the planner refines the stored anchor with the
    /// distilled goal and success criteria, when its output names them.
    fn refine_intent_anchor(&self, task: &Task, visible: &str) {
        let mut anchor = self
            .bus
            .get_intent(&task.task_id)
            .unwrap_or_else(|| IntentAnchor {
                user_message: task.description.clone(),
                task_id: task.task_id.clone(),
                ..Default::default()
            });
        let mut changed = false;
        for line in visible.lines() {
            let line = line.trim();
            if let Some(goal) = line.strip_prefix("GOAL:") {
                anchor.core_goal = goal.trim().to_string();
                changed = true;
            } else if let Some(criteria) = line.strip_prefix("SUCCESS:") {
                anchor.success_criteria = criteria
                    .split(';')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect();
                changed = true;
            }
        }
        if changed {
            self.bus.put_intent(&anchor);
        }
    }

    /// Close-out: synthesize the final answer from collected results and
    /// reviewer feedback against the intent anchor, then store it on the
    /// root task.
    async fn execute_closeout(&self, task: &Task, root_id: &str) -> Result<(), String> {
        let (results, critiques) = self.board.collect_results_with_critiques(root_id, None);
        let anchor = self.bus.get_intent(root_id);

        let mut prompt = String::from(
            "All subtasks have finished. Synthesize the final user-facing answer.\n\n",
        );
        if let Some(anchor) = &anchor {
            prompt.push_str(&format!(
                "Original request: {}\nCore goal: {}\nSuccess criteria: {}\n\n",
                anchor.user_message,
                anchor.core_goal,
                anchor.success_criteria.join("; "),
            ));
        }
        prompt.push_str(&format!(
            "## Subtask results\n\n{results}\n\n## Reviewer feedback\n\n{critiques}\n"
        ));

        let messages = vec![
            ChatMessage::system(self.system_prompt(task)),
            ChatMessage::user(prompt),
        ];
        let raw = self.call_model(task, messages).await?;
        let answer = strip_think(&raw);

        if self.task_interrupted(&task.task_id) {
            return Ok(());
        }

        // The final answer lives on the root task; the close-out ticket
        // carries a copy.
        self.board
            .submit_for_review(root_id, answer.clone())
            .map_err(|e| e.to_string())?;
        self.board.complete(root_id).map_err(|e| e.to_string())?;
        self.board
            .submit_for_review(&task.task_id, answer)
            .map_err(|e| e.to_string())?;
        self.board.complete(&task.task_id).map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Reviewer ticket: grade the target task, attach the critique, log it
    /// for TextGrad, and close the ticket.
    async fn execute_review(&self, task: &Task) -> Result<(), String> {
        let target_id = task
            .description
            .strip_prefix(REVIEW_MARKER)
            .and_then(|rest| rest.split(']').next())
            .unwrap_or("")
            .to_string();
        let Some(target) = self.board.get(&target_id) else {
            self.board
                .submit_for_review(&task.task_id, "(review target vanished)")
                .map_err(|e| e.to_string())?;
            self.board.complete(&task.task_id).map_err(|e| e.to_string())?;
            return Ok(());
        };

        // Externally-delegated results are graded with a trust penalty.
        let source_trust = extract_source_trust(&target);
        let trust_note = match &source_trust {
            Some(st) => format!(
                "\nThis result came from an external agent ({}, trust level: {}). \
                 Reduce any dimension scored on externally-returned content by the \
                 trust penalty and record the provenance.",
                st.agent_url, st.trust_level
            ),
            None => String::new(),
        };

        let prompt = format!(
            "Review the following task result. Respond with a JSON object \
             matching the critique schema: {{\"dimensions\": {{\"accuracy\": 1-10, \
             \"completeness\": 1-10, \"technical\": 1-10, \"calibration\": 1-10, \
             \"efficiency\": 1-10}}, \"verdict\": \"LGTM\"|\"NEEDS_WORK\", \
             \"items\": [{{\"dimension\", \"issue\", \"suggestion\"}}], \
             \"confidence\": 0.0-1.0}}.{trust_note}\n\n\
             ## Task\n{}\n\n## Result\n{}",
            target.description,
            target.result.as_deref().unwrap_or("(no result)"),
        );
        let messages = vec![
            ChatMessage::system(self.system_prompt(task)),
            ChatMessage::user(prompt),
        ];
        let raw = self.call_model(task, messages).await?;
        let visible = strip_think(&raw);

        let mut spec = parse_critique_output(&visible);
        spec.task_id = target_id.clone();
        spec.reviewer_id = self.agent.id.clone();
        spec.timestamp = crate::now_ts();
        if let Some(st) = source_trust {
            spec.source_trust = st;
        }
        spec.auto_simplify();

        let suggestions: Vec<String> = spec
            .items
            .iter()
            .map(|i| {
                if i.suggestion.is_empty() {
                    i.issue.clone()
                } else {
                    i.suggestion.clone()
                }
            })
            .filter(|s| !s.is_empty())
            .collect();
        let comment = spec
            .items
            .first()
            .map(|i| i.issue.clone())
            .unwrap_or_else(|| "reviewed".to_string());
        let score = spec.composite_score().round() as i64;

        self.board
            .add_critique(
                &target_id,
                &self.agent.id,
                spec.passed(),
                suggestions,
                &comment,
                score,
            )
            .map_err(|e| e.to_string())?;

        let graded_agent = target.agent_id.clone().unwrap_or_default();
        textgrad::append_critique(&self.workdir, &spec, &graded_agent);

        self.board
            .submit_for_review(&task.task_id, spec.to_json())
            .map_err(|e| e.to_string())?;
        self.board.complete(&task.task_id).map_err(|e| e.to_string())?;
        Ok(())
    }

    // ── Model invocation ────────────────────────────────────────────────

    /// Drive the provider once, streaming partial text to the board and
    /// recording usage/cost. Budget exhaustion fails the task.
    async fn call_model(&self, task: &Task, messages: Vec<ChatMessage>) -> Result<String, String> {
        let request = CompletionRequest {
            model: self.agent.model.clone(),
            messages,
            max_tokens: None,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let board = self.board.clone();
        let task_id = task.task_id.clone();
        let streamer = tokio::spawn(async move {
            let mut acc = String::new();
            while let Some(chunk) = rx.recv().await {
                acc.push_str(&chunk);
                let _ = board.update_partial(&task_id, &strip_think(&acc));
            }
        });

        let result = self.provider.complete(&request, Some(tx)).await;
        let _ = streamer.await;

        match result {
            Ok(completion) => {
                let usage = CallUsage {
                    prompt_tokens: completion.prompt_tokens,
                    completion_tokens: completion.completion_tokens,
                    latency_ms: completion.latency_ms,
                    success: true,
                    retries: completion.retries,
                    failover: false,
                };
                let cost = match self.tracker.record(&self.agent.id, &self.agent.model, usage) {
                    Ok(record) => record.cost_usd,
                    Err(UsageError::BudgetExceeded(msg)) => {
                        return Err(format!("budget exceeded: {msg}"));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "usage record failed");
                        0.0
                    }
                };
                if cost > 0.0 {
                    let _ = self.board.set_cost(&task.task_id, cost);
                }
                Ok(completion.text)
            }
            Err(e) => {
                let _ = self.tracker.record(
                    &self.agent.id,
                    &self.agent.model,
                    CallUsage {
                        success: false,
                        ..Default::default()
                    },
                );
                Err(e.to_string())
            }
        }
    }

    // ── Tools ───────────────────────────────────────────────────────────

    async fn run_tool_calls(&self, task: &Task, calls: &[tools::ToolCall]) -> Vec<Value> {
        let tools_cfg = self.agent.tools_config(&self.config.tools);
        let mut available = tools::get_available_tools(&tools_cfg);
        if let Some(spec) = SubTaskSpec::from_task_description(&task.description) {
            available = tools::filter_by_hint(available, &spec.tool_hint);
        }

        let ctx = ToolContext {
            workdir: self.workdir.clone(),
            agent_id: self.agent.id.clone(),
        };

        let mut results = Vec::new();
        for call in calls {
            // Delegation runs on the async client, outside generic dispatch.
            if call.tool == "a2a_delegate" {
                results.push(json!({
                    "tool": call.tool,
                    "result": self.delegate_from_call(&call.params).await,
                }));
                continue;
            }
            let call_clone = call.clone();
            let ctx_clone = ctx.clone();
            let allowed: Vec<&'static str> = available.iter().map(|t| t.name).collect();
            let result = tokio::task::spawn_blocking(move || {
                let set = tools::list_all_tools();
                let usable: Vec<&tools::Tool> =
                    set.iter().filter(|t| allowed.contains(&t.name)).collect();
                tools::execute_tool_calls(&ctx_clone, &[call_clone], &usable)
                    .pop()
                    .map(|(_, v)| v)
                    .unwrap_or_else(|| json!({"ok": false, "error": "no result"}))
            })
            .await
            .unwrap_or_else(|e| json!({"ok": false, "error": format!("tool panicked: {e}")}));
            results.push(json!({"tool": call.tool, "result": result}));
        }
        results
    }

    async fn delegate_from_call(&self, params: &Value) -> Value {
        let Some(delegator) = &self.delegator else {
            return json!({"ok": false, "error": "A2A client is not enabled"});
        };
        let agent_url = params["agent_url"].as_str().unwrap_or("auto");
        let message = params["message"].as_str().unwrap_or("");
        let skills: Vec<String> = params["required_skills"]
            .as_str()
            .map(|s| s.split(',').map(|x| x.trim().to_string()).collect())
            .unwrap_or_default();
        let timeout = params["timeout"].as_f64().unwrap_or(120.0);
        delegator.delegate(agent_url, message, &skills, timeout).await
    }

    /// Delegate a whole subtask when its spec carries an A2A hint.
    /// Returns `Ok(None)` when delegation is unavailable and local
    /// execution should proceed.
    async fn try_delegate(
        &self,
        task: &Task,
        spec: &SubTaskSpec,
    ) -> Result<Option<String>, String> {
        let Some(delegator) = &self.delegator else {
            tracing::info!(task_id = %task.task_id, "a2a hint present but client disabled");
            return Ok(None);
        };
        let url = if spec.a2a_hint.preferred_agent.is_empty() {
            "auto"
        } else {
            &spec.a2a_hint.preferred_agent
        };
        let result = delegator
            .delegate(url, &spec.objective, &spec.a2a_hint.required_skills, 120.0)
            .await;
        let status = result["status"].as_str().unwrap_or("failed");
        if status == "completed" {
            let text = result["text"].as_str().unwrap_or("").to_string();
            tracing::info!(task_id = %task.task_id, agent = %result["agent_name"], "delegated via A2A");
            return Ok(Some(format!(
                "{text}\n\n[source_trust] {}",
                json!({
                    "agent_url": result["agent_url"],
                    "trust_level": result["trust_level"],
                    "data_freshness": chrono::Utc::now().to_rfc3339(),
                    "cross_validated": false,
                })
            )));
        }
        if !spec.a2a_hint.fallback.is_empty() {
            tracing::warn!(status, "delegation failed; falling back to local execution");
            return Ok(None);
        }
        Err(format!(
            "a2a delegation failed: {}",
            result["error"].as_str().unwrap_or(status)
        ))
    }

    async fn finish_with(&self, task: &Task, result: String) -> Result<(), String> {
        if self.task_interrupted(&task.task_id) {
            return Ok(());
        }
        self.board
            .submit_for_review(&task.task_id, result)
            .map_err(|e| e.to_string())
    }

    /// Cancellation is advisory: the board may have moved the task while
    /// the model was running. Checked after tool rounds and before any
    /// submit.
    fn task_interrupted(&self, task_id: &str) -> bool {
        matches!(
            self.board.get(task_id).map(|t| t.status),
            Some(TaskStatus::Cancelled) | Some(TaskStatus::Paused) | None
        )
    }

    // ── Prompt assembly ─────────────────────────────────────────────────

    fn system_prompt(&self, task: &Task) -> String {
        let mut sections = vec![format!(
            "You are {}, {}.",
            self.agent.id,
            if self.agent.role.is_empty() {
                "an agent on the Cleo team"
            } else {
                &self.agent.role
            }
        )];

        let team = skills::load_team_skills(&self.workdir);
        if !team.is_empty() {
            sections.push(format!("## Team skills\n\n{team}"));
        }
        let own = skills::load_agent_skills(&self.workdir, &self.agent.id);
        if !own.is_empty() {
            sections.push(format!("## Your skills\n\n{own}"));
        }
        let patch = skills::load_override(&self.workdir, &self.agent.id);
        if !patch.is_empty() {
            sections.push(patch);
        }

        if self.is_planner()
            && !self.is_review_ticket(task)
            && !task.description.starts_with(CLOSEOUT_MARKER)
        {
            sections.push(PLANNER_INSTRUCTIONS.to_string());
        }

        // Tool schemas, narrowed by the subtask's hint where present.
        let tools_cfg = self.agent.tools_config(&self.config.tools);
        let mut available = tools::get_available_tools(&tools_cfg);
        if let Some(spec) = SubTaskSpec::from_task_description(&task.description) {
            available = tools::filter_by_hint(available, &spec.tool_hint);
        }
        let tools_prompt = tools::build_tools_prompt(&available);
        if !tools_prompt.is_empty() {
            sections.push(tools_prompt);
        }

        // The intent anchor keeps subtasks aligned with the user's goal.
        if let Some(anchor) = self.find_anchor(task) {
            sections.push(format!(
                "## User intent\n\nOriginal request: {}\nCore goal: {}\nSuccess criteria: {}",
                anchor.user_message,
                anchor.core_goal,
                anchor.success_criteria.join("; "),
            ));
        }

        sections.join("\n\n")
    }

    /// Anchor lookup: the task itself, then up the parent chain.
    fn find_anchor(&self, task: &Task) -> Option<IntentAnchor> {
        if let Some(anchor) = self.bus.get_intent(&task.task_id) {
            return Some(anchor);
        }
        let mut current = task.parent_id.clone();
        let mut hops = 0;
        while let Some(pid) = current {
            if hops > 8 {
                break;
            }
            if let Some(anchor) = self.bus.get_intent(&pid) {
                return Some(anchor);
            }
            current = self.board.get(&pid).and_then(|t| t.parent_id);
            hops += 1;
        }
        None
    }
}

const PLANNER_INSTRUCTIONS: &str = "\
## Routing

Your FIRST line must be `ROUTE: DIRECT_ANSWER` or `ROUTE: MAS_PIPELINE`.

- DIRECT_ANSWER: answer the user immediately on the following lines.
- MAS_PIPELINE: decompose the request into subtasks, one block each:

[SubTaskSpec] <objective>
Constraints: <constraint>; <constraint>
Output format: <markdown_table|json|code|file|text>
Tool categories: <web, fs, automation, a2a_delegate, ...>

Optionally refine the goal with `GOAL: <one line>` and
`SUCCESS: <criterion>; <criterion>` lines.";

/// Decode planner decomposition output: `[SubTaskSpec]` blocks first,
/// legacy `TASK:` lines as fallback.
pub fn parse_planner_subtasks(output: &str, parent_intent: &str) -> Vec<SubTaskSpec> {
    let mut specs = Vec::new();

    // Split on block starts; each block runs until the next blank line.
    let mut current: Vec<&str> = Vec::new();
    let mut in_block = false;
    let mut blocks: Vec<Vec<&str>> = Vec::new();
    for line in output.lines() {
        if line.trim_start().starts_with("[SubTaskSpec]") {
            if in_block && !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            in_block = true;
            current.push(line.trim_start());
        } else if in_block {
            if line.trim().is_empty() {
                blocks.push(std::mem::take(&mut current));
                in_block = false;
            } else {
                current.push(line.trim());
            }
        }
    }
    if in_block && !current.is_empty() {
        blocks.push(current);
    }

    for block in blocks {
        if let Some(mut spec) = SubTaskSpec::from_task_description(&block.join("\n")) {
            spec.parent_intent = parent_intent.to_string();
            specs.push(spec);
        }
    }

    if specs.is_empty() {
        // Legacy format: one TASK: line per subtask.
        for line in output.lines() {
            if let Some(desc) = line.trim().strip_prefix("TASK:") {
                let desc = desc.trim();
                if !desc.is_empty() {
                    let mut spec = SubTaskSpec::from_legacy_task(desc, "normal");
                    spec.parent_intent = parent_intent.to_string();
                    specs.push(spec);
                }
            }
        }
    }
    specs
}

/// Role for a subtask. Everything the planner emits is executor-class
/// work ("execute" maps to the whole executor agent set); review tickets
/// are created separately by the orchestrator.
fn infer_required_role(_spec: &SubTaskSpec) -> String {
    "execute".to_string()
}

/// Parse the reviewer model's output into a CritiqueSpec; a flat score
/// line degrades gracefully to the legacy form.
fn parse_critique_output(visible: &str) -> CritiqueSpec {
    // Direct JSON, possibly inside a code fence.
    let candidate = visible.trim();
    let json_text = if let Some(start) = candidate.find('{') {
        let end = candidate.rfind('}').map(|e| e + 1).unwrap_or(candidate.len());
        &candidate[start..end]
    } else {
        candidate
    };
    if let Ok(spec) = CritiqueSpec::from_json(json_text) {
        return spec;
    }

    // Legacy: look for "score: N".
    let score = visible
        .lines()
        .find_map(|l| {
            let l = l.trim().to_lowercase();
            l.strip_prefix("score:")
                .and_then(|rest| rest.trim().split('/').next()?.trim().parse::<i64>().ok())
        })
        .unwrap_or(7);
    CritiqueSpec::from_legacy_score(score, &[], crate::now_ts())
}

/// Read a `[source_trust]` marker out of a delegated task's result.
fn extract_source_trust(target: &Task) -> Option<SourceTrust> {
    let result = target.result.as_deref()?;
    let marker = result.rfind("[source_trust]")?;
    let payload = result[marker + "[source_trust]".len()..].trim();
    serde_json::from_str(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;

    fn agent(id: &str, role: &str) -> AgentConfig {
        AgentConfig {
            id: id.to_string(),
            role: role.to_string(),
            model: "kimi-k2.5".to_string(),
            skills: vec![],
            fallback_models: vec![],
            autonomy_level: String::new(),
            llm: Default::default(),
            tools: None,
            reputation: 100,
        }
    }

    fn make_worker(dir: &tempfile::TempDir, agent_cfg: AgentConfig, responses: Vec<&str>) -> Worker {
        let workdir = Workdir::new(dir.path());
        let provider = Arc::new(ScriptedProvider::new(
            responses.into_iter().map(|s| s.to_string()).collect(),
        ));
        Worker::new(
            workdir,
            CleoConfig::default(),
            agent_cfg,
            provider,
            WorkerOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_executor_submits_for_review() {
        let dir = tempfile::tempdir().unwrap();
        let worker = make_worker(&dir, agent("jerry", "Implementation agent"), vec!["the result"]);
        let task = worker.board.create_simple("do something useful").unwrap();

        assert!(worker.poll_once().await.unwrap());
        let t = worker.board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Review);
        assert_eq!(t.result.as_deref(), Some("the result"));
        // Usage was recorded and cost attributed.
        assert_eq!(worker.tracker.aggregate().total_calls, 1);
    }

    #[tokio::test]
    async fn test_idle_poll_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let worker = make_worker(&dir, agent("jerry", "executor"), vec!["x"]);
        assert!(!worker.poll_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_planner_direct_answer_completes_root() {
        let dir = tempfile::tempdir().unwrap();
        let worker = make_worker(&dir, agent("leo", "Planner"), vec!["ROUTE: DIRECT_ANSWER\n4"]);
        let root = worker
            .board
            .create("What is 2+2?".to_string(), vec![], 0, Some("planner".into()), None)
            .unwrap();

        assert!(worker.poll_once().await.unwrap());
        let t = worker.board.get(&root.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.result.as_deref(), Some("4"));
        // No subtasks were created.
        assert_eq!(worker.board.all().len(), 1);
    }

    #[tokio::test]
    async fn test_planner_decomposes_into_subtasks() {
        let dir = tempfile::tempdir().unwrap();
        let output = "ROUTE: MAS_PIPELINE\nGOAL: two-part report\nSUCCESS: both parts present\n\n\
                      [SubTaskSpec] research the topic\nTool categories: web\n\n\
                      [SubTaskSpec] write the summary\nOutput format: markdown\n";
        let worker = make_worker(&dir, agent("leo", "Planner"), vec![output]);
        let root = worker
            .board
            .create("research then summarize".to_string(), vec![], 0, Some("planner".into()), None)
            .unwrap();
        worker.bus.put_intent(&IntentAnchor {
            user_message: "research then summarize".into(),
            task_id: root.task_id.clone(),
            ..Default::default()
        });

        assert!(worker.poll_once().await.unwrap());
        let all = worker.board.all();
        assert_eq!(all.len(), 3);
        let subtasks: Vec<&Task> = all
            .iter()
            .filter(|t| t.parent_id.as_deref() == Some(root.task_id.as_str()))
            .collect();
        assert_eq!(subtasks.len(), 2);
        assert!(subtasks
            .iter()
            .all(|t| t.required_role.as_deref() == Some("execute")));
        assert!(subtasks[0].description.starts_with("[SubTaskSpec]"));

        // The anchor got refined.
        let anchor = worker.bus.get_intent(&root.task_id).unwrap();
        assert_eq!(anchor.core_goal, "two-part report");
        assert_eq!(anchor.success_criteria, vec!["both parts present"]);
    }

    #[tokio::test]
    async fn test_legacy_task_lines_decompose() {
        let specs = parse_planner_subtasks("TASK: first thing\nTASK: second thing", "intent");
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].objective, "first thing");
        assert_eq!(specs[1].parent_intent, "intent");
    }

    #[tokio::test]
    async fn test_tool_loop_executes_and_feeds_back() {
        let dir = tempfile::tempdir().unwrap();
        let first = "```tool\n{\"tool\": \"write_file\", \"params\": {\"path\": \"workspace/out.txt\", \"content\": \"written by tool\"}}\n```";
        let worker = make_worker(
            &dir,
            agent("jerry", "executor"),
            vec![first, "file is written, done"],
        );
        let task = worker.board.create_simple("write a file").unwrap();

        assert!(worker.poll_once().await.unwrap());
        let t = worker.board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Review);
        assert_eq!(t.result.as_deref(), Some("file is written, done"));
        let written =
            std::fs::read_to_string(dir.path().join("workspace/out.txt")).unwrap();
        assert_eq!(written, "written by tool");
    }

    #[tokio::test]
    async fn test_reviewer_ticket_grades_target() {
        let dir = tempfile::tempdir().unwrap();
        let critique_json = r#"{"dimensions": {"accuracy": 9, "completeness": 9, "technical": 8,
            "calibration": 8, "efficiency": 9}, "verdict": "LGTM", "items": [], "confidence": 0.9}"#;
        let worker = make_worker(&dir, agent("alic", "Peer reviewer"), vec![critique_json]);

        // Target finished work and sits in review.
        let target = worker.board.create_simple("write hello world").unwrap();
        worker.board.claim_next("jerry", 100, None).unwrap();
        worker.board.submit_for_review(&target.task_id, "hello world").unwrap();

        // The orchestrator's review ticket.
        worker
            .board
            .create(
                format!("{REVIEW_MARKER}{}] write hello world", target.task_id),
                vec![],
                0,
                Some("review".to_string()),
                Some(target.task_id.clone()),
            )
            .unwrap();

        assert!(worker.poll_once().await.unwrap());

        let t = worker.board.get(&target.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        let critique = t.critique.unwrap();
        assert!(critique.passed);
        assert_eq!(critique.reviewer, "alic");

        // Critique landed in the TextGrad log attributed to jerry.
        let log = std::fs::read_to_string(
            Workdir::new(dir.path()).critique_log(),
        )
        .unwrap();
        assert!(log.contains("\"agent_id\":\"jerry\""));
    }

    #[tokio::test]
    async fn test_reviewer_needs_work_enters_critique_loop() {
        let dir = tempfile::tempdir().unwrap();
        let critique_json = r#"{"dimensions": {"accuracy": 4, "completeness": 5, "technical": 5,
            "calibration": 5, "efficiency": 5}, "verdict": "NEEDS_WORK",
            "items": [{"dimension": "accuracy", "issue": "wrong output", "suggestion": "fix the math"}],
            "confidence": 0.7}"#;
        let worker = make_worker(&dir, agent("alic", "Peer reviewer"), vec![critique_json]);

        let target = worker.board.create_simple("compute the sum").unwrap();
        worker.board.claim_next("jerry", 100, None).unwrap();
        worker.board.submit_for_review(&target.task_id, "wrong answer").unwrap();
        worker
            .board
            .create(
                format!("{REVIEW_MARKER}{}] compute the sum", target.task_id),
                vec![],
                0,
                Some("review".to_string()),
                Some(target.task_id.clone()),
            )
            .unwrap();

        assert!(worker.poll_once().await.unwrap());
        let t = worker.board.get(&target.task_id).unwrap();
        // First rejection → critique state, one revision round for jerry.
        assert_eq!(t.status, TaskStatus::Critique);
        assert_eq!(t.critique_round, 1);
        assert!(worker.board.claim_critique("jerry").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_closeout_synthesizes_onto_root() {
        let dir = tempfile::tempdir().unwrap();
        let worker = make_worker(&dir, agent("leo", "Planner"), vec!["the final synthesis"]);

        // Root already decomposed and completed by the planner; the
        // subtask finished and was reviewed.
        let root = worker.board.create_simple("big request").unwrap();
        worker.board.claim_next("jerry", 100, None).unwrap();
        worker.board.submit_for_review(&root.task_id, "decomposition").unwrap();
        worker.board.complete(&root.task_id).unwrap();

        let sub = worker
            .board
            .create("[SubTaskSpec] part one".to_string(), vec![], 0, None, Some(root.task_id.clone()))
            .unwrap();
        worker.board.claim_next("jerry", 100, None).unwrap();
        worker.board.submit_for_review(&sub.task_id, "part one result").unwrap();
        worker.board.complete(&sub.task_id).unwrap();

        worker
            .board
            .create(
                format!("{CLOSEOUT_MARKER}{}", root.task_id),
                vec![],
                0,
                Some("planner".to_string()),
                Some(root.task_id.clone()),
            )
            .unwrap();

        assert!(worker.poll_once().await.unwrap());
        let t = worker.board.get(&root.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.result.as_deref(), Some("the final synthesis"));
    }

    #[tokio::test]
    async fn test_budget_exceeded_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let worker = make_worker(&dir, agent("jerry", "executor"), vec!["result"]);
        worker
            .tracker
            .set_budget(&crate::usage::Budget {
                enabled: true,
                max_cost_usd: 0.00000001,
                ..Default::default()
            })
            .unwrap();
        let task = worker.board.create_simple("spend money").unwrap();

        assert!(worker.poll_once().await.unwrap());
        let t = worker.board.get(&task.task_id).unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t
            .evolution_flags
            .iter()
            .any(|f| f.contains("budget exceeded")));
    }

    #[tokio::test]
    async fn test_restricted_reviewer_ignores_executor_work() {
        let dir = tempfile::tempdir().unwrap();
        let worker = make_worker(&dir, agent("alic", "Peer reviewer"), vec!["x"]);
        worker
            .board
            .create("write hello world".to_string(), vec![], 0, Some("implement".into()), None)
            .unwrap();
        assert!(!worker.poll_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_streaming_updates_partial() {
        let dir = tempfile::tempdir().unwrap();
        let worker = make_worker(
            &dir,
            agent("jerry", "executor"),
            vec!["a somewhat longer streamed response body"],
        );
        let task = worker.board.create_simple("stream me").unwrap();
        worker.poll_once().await.unwrap();
        let t = worker.board.get(&task.task_id).unwrap();
        assert_eq!(
            t.partial_result.as_deref(),
            Some("a somewhat longer streamed response body")
        );
    }

    #[test]
    fn test_parse_critique_fenced_json() {
        let text = "```json\n{\"verdict\": \"NEEDS_WORK\", \"items\": []}\n```";
        let spec = parse_critique_output(text);
        assert_eq!(spec.verdict, "NEEDS_WORK");
    }

    #[test]
    fn test_parse_critique_legacy_score_line() {
        let spec = parse_critique_output("Overall fine.\nScore: 6/10");
        assert_eq!(spec.dimensions.accuracy, 6);
    }

    #[test]
    fn test_extract_source_trust() {
        let mut task = Task::new("x");
        task.result = Some(format!(
            "the answer\n\n[source_trust] {}",
            json!({"agent_url": "https://ext", "trust_level": "community",
                   "data_freshness": "", "cross_validated": false})
        ));
        let st = extract_source_trust(&task).unwrap();
        assert_eq!(st.trust_level, "community");
        assert!(extract_source_trust(&Task::new("y")).is_none());
    }
}

//! Tool registry and scoped execution.
//!
//! Tools are first-class values: the system-prompt fragment and the JSON
//! schema handed to function-calling models are built from the same
//! registry entry. An agent's config selects a profile and may allow/deny
//! individual tools or whole `group:<category>` expansions; deny always
//! wins. The planner's `SubTaskSpec.tool_hint` narrows the scope further
//! for a single subtask.

pub mod sanitize;

use std::io::Read as _;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::board::TaskBoard;
use crate::config::ToolsConfig;
use crate::mailbox::Mailbox;
use crate::protocols::ToolCategory;
use crate::workdir::Workdir;

pub use sanitize::sanitize_params;

/// Execution context handed to every tool handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workdir: Workdir,
    pub agent_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ToolParam {
    pub name: &'static str,
    pub param_type: &'static str,
    pub description: &'static str,
    pub required: bool,
}

impl ToolParam {
    pub const fn required(name: &'static str, param_type: &'static str, description: &'static str) -> Self {
        Self { name, param_type, description, required: true }
    }

    pub const fn optional(name: &'static str, param_type: &'static str, description: &'static str) -> Self {
        Self { name, param_type, description, required: false }
    }
}

pub type ToolHandler = fn(&ToolContext, &Map<String, Value>) -> Result<Value, String>;

pub struct Tool {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ToolParam>,
    pub category: ToolCategory,
    pub requires_env: &'static [&'static str],
    pub handler: ToolHandler,
}

impl Tool {
    /// A tool is offered only when its env requirements are satisfied.
    pub fn is_available(&self) -> bool {
        self.requires_env
            .iter()
            .all(|var| std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false))
    }

    /// One-line prompt fragment.
    pub fn to_prompt(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                if p.required {
                    format!("{} ({}, required)", p.name, p.param_type)
                } else {
                    format!("{} ({})", p.name, p.param_type)
                }
            })
            .collect();
        if params.is_empty() {
            format!("- **{}**: {}", self.name, self.description)
        } else {
            format!("- **{}**: {} — params: {}", self.name, self.description, params.join(", "))
        }
    }

    /// JSON schema for function-calling models.
    pub fn to_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in &self.params {
            properties.insert(
                p.name.to_string(),
                json!({"type": p.param_type, "description": p.description}),
            );
            if p.required {
                required.push(Value::String(p.name.to_string()));
            }
        }
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        })
    }

    /// Sanitize then run.
    pub fn execute(&self, ctx: &ToolContext, params: &Value) -> Value {
        match sanitize_params(self.name, params, Some(self)) {
            Ok(clean) => match (self.handler)(ctx, &clean) {
                Ok(v) => v,
                Err(e) => json!({"ok": false, "error": e}),
            },
            Err(e) => json!({"ok": false, "error": e}),
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────────

static REGISTRY: Lazy<Vec<Tool>> = Lazy::new(builtin_tools);

pub fn get_tool(name: &str) -> Option<&'static Tool> {
    REGISTRY.iter().find(|t| t.name == name)
}

pub fn list_all_tools() -> &'static [Tool] {
    &REGISTRY
}

fn profile_base(profile: &str) -> Option<&'static [&'static str]> {
    const MINIMAL: &[&str] = &["web_search", "web_fetch", "memory_search", "kb_search"];
    const CODING: &[&str] = &[
        "web_search", "web_fetch", "exec", "read_file", "write_file", "edit_file", "list_dir",
        "memory_search", "memory_save", "kb_search", "kb_write", "task_create", "task_status",
    ];
    match profile {
        "minimal" => Some(MINIMAL),
        "coding" => Some(CODING),
        // full (and anything unrecognized) allows every tool
        _ => None,
    }
}

/// Expand a tool name or `group:<category>` selector.
fn expand_selector(item: &str) -> Vec<&'static str> {
    if let Some(category) = item.strip_prefix("group:") {
        REGISTRY
            .iter()
            .filter(|t| t.category.as_str() == category)
            .map(|t| t.name)
            .collect()
    } else {
        REGISTRY
            .iter()
            .filter(|t| t.name == item)
            .map(|t| t.name)
            .collect()
    }
}

/// Resolve the tool set for an agent: profile base, minus deny, plus allow.
/// Deny always wins; env-gated tools are dropped when unavailable.
pub fn get_available_tools(cfg: &ToolsConfig) -> Vec<&'static Tool> {
    let base = profile_base(&cfg.profile);
    let allowed: Vec<&str> = cfg.allow.iter().flat_map(|i| expand_selector(i)).collect();
    let denied: Vec<&str> = cfg.deny.iter().flat_map(|i| expand_selector(i)).collect();

    REGISTRY
        .iter()
        .filter(|t| !denied.contains(&t.name))
        .filter(|t| match base {
            Some(names) => names.contains(&t.name) || allowed.contains(&t.name),
            None => true,
        })
        .filter(|t| t.is_available())
        .collect()
}

/// Narrow a tool set to the categories named in a subtask's tool hint.
/// An empty hint leaves the set untouched.
pub fn filter_by_hint<'a>(tools: Vec<&'a Tool>, hint: &[String]) -> Vec<&'a Tool> {
    if hint.is_empty() {
        return tools;
    }
    tools
        .into_iter()
        .filter(|t| hint.iter().any(|h| h == t.category.as_str()))
        .collect()
}

/// Build the tools section of an agent system prompt.
pub fn build_tools_prompt(tools: &[&Tool]) -> String {
    if tools.is_empty() {
        return String::new();
    }
    let mut lines = vec![
        "## Available Tools".to_string(),
        String::new(),
        "You can invoke tools by including a JSON block in your response:".to_string(),
        "```tool".to_string(),
        r#"{"tool": "tool_name", "params": {"param1": "value1"}}"#.to_string(),
        "```".to_string(),
        String::new(),
        "Available tools:".to_string(),
        String::new(),
    ];
    lines.extend(tools.iter().map(|t| t.to_prompt()));
    lines.join("\n")
}

pub fn build_tools_schemas(tools: &[&Tool]) -> Vec<Value> {
    tools.iter().map(|t| t.to_schema()).collect()
}

// ── Invocation parsing ──────────────────────────────────────────────────

static TOOL_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```tool\s*\n(\{[^`]+?\})\s*\n```").expect("static regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    pub params: Value,
    pub raw: String,
}

/// Extract fenced ```tool invocation blocks from model output.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    for captures in TOOL_BLOCK_RE.captures_iter(text) {
        let Ok(data) = serde_json::from_str::<Value>(&captures[1]) else {
            continue;
        };
        let Some(tool) = data.get("tool").and_then(|t| t.as_str()) else {
            continue;
        };
        calls.push(ToolCall {
            tool: tool.to_string(),
            params: data.get("params").cloned().unwrap_or_else(|| json!({})),
            raw: captures[0].to_string(),
        });
    }
    calls
}

/// Execute parsed calls against an agent's available tool set.
pub fn execute_tool_calls(
    ctx: &ToolContext,
    calls: &[ToolCall],
    available: &[&Tool],
) -> Vec<(String, Value)> {
    let mut results = Vec::new();
    for call in calls {
        let Some(tool) = available.iter().find(|t| t.name == call.tool) else {
            results.push((
                call.tool.clone(),
                json!({"ok": false, "error": format!("Tool '{}' not available", call.tool)}),
            ));
            continue;
        };
        tracing::info!(tool = call.tool, "executing tool");
        results.push((call.tool.clone(), tool.execute(ctx, &call.params)));
    }
    results
}

// ── Builtin tools ───────────────────────────────────────────────────────

fn builtin_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "web_search",
            description: "Search the web using the Brave Search API.",
            params: vec![
                ToolParam::required("query", "string", "Search query"),
                ToolParam::optional("count", "integer", "Number of results (1-10)"),
            ],
            category: ToolCategory::Web,
            requires_env: &["BRAVE_API_KEY"],
            handler: handle_web_search,
        },
        Tool {
            name: "web_fetch",
            description: "Fetch a URL and extract readable text content.",
            params: vec![
                ToolParam::required("url", "string", "URL to fetch"),
                ToolParam::optional("max_chars", "integer", "Max chars to return (default 8000)"),
            ],
            category: ToolCategory::Web,
            requires_env: &[],
            handler: handle_web_fetch,
        },
        Tool {
            name: "exec",
            description: "Execute a shell command. Only allowlisted commands are permitted.",
            params: vec![
                ToolParam::required("command", "string", "Shell command to run"),
                ToolParam::optional("timeout", "integer", "Max seconds (default 120)"),
            ],
            category: ToolCategory::Automation,
            requires_env: &[],
            handler: handle_exec,
        },
        Tool {
            name: "read_file",
            description: "Read a file from the project directory.",
            params: vec![
                ToolParam::required("path", "string", "File path relative to project root"),
                ToolParam::optional("max_lines", "integer", "Max lines to read (default 200)"),
            ],
            category: ToolCategory::Fs,
            requires_env: &[],
            handler: handle_read_file,
        },
        Tool {
            name: "write_file",
            description: "Write content to a file in the project directory.",
            params: vec![
                ToolParam::required("path", "string", "File path relative to project root"),
                ToolParam::required("content", "string", "Content to write"),
            ],
            category: ToolCategory::Fs,
            requires_env: &[],
            handler: handle_write_file,
        },
        Tool {
            name: "list_dir",
            description: "List directory contents.",
            params: vec![ToolParam::optional(
                "path",
                "string",
                "Directory path (default: project root)",
            )],
            category: ToolCategory::Fs,
            requires_env: &[],
            handler: handle_list_dir,
        },
        Tool {
            name: "edit_file",
            description: "Find-and-replace edit in a project file. The old_str must be unique.",
            params: vec![
                ToolParam::required("path", "string", "File path relative to project root"),
                ToolParam::required("old_str", "string", "Exact text to find (must be unique)"),
                ToolParam::required("new_str", "string", "Replacement text"),
            ],
            category: ToolCategory::Fs,
            requires_env: &[],
            handler: handle_edit_file,
        },
        Tool {
            name: "memory_search",
            description: "Search episodic memory for past problem→solution cases.",
            params: vec![
                ToolParam::required("query", "string", "Search query"),
                ToolParam::optional("limit", "integer", "Max results (default 5)"),
            ],
            category: ToolCategory::Memory,
            requires_env: &[],
            handler: handle_memory_search,
        },
        Tool {
            name: "memory_save",
            description: "Save a problem→solution case to episodic memory.",
            params: vec![
                ToolParam::required("problem", "string", "Problem description"),
                ToolParam::required("solution", "string", "Solution description"),
                ToolParam::optional("tags", "string", "Comma-separated tags"),
            ],
            category: ToolCategory::Memory,
            requires_env: &[],
            handler: handle_memory_save,
        },
        Tool {
            name: "kb_search",
            description: "Search the shared knowledge base for notes.",
            params: vec![
                ToolParam::required("query", "string", "Search query"),
                ToolParam::optional("limit", "integer", "Max results (default 5)"),
            ],
            category: ToolCategory::Memory,
            requires_env: &[],
            handler: handle_kb_search,
        },
        Tool {
            name: "kb_write",
            description: "Create or update a note in the shared knowledge base.",
            params: vec![
                ToolParam::required("topic", "string", "Note topic/title"),
                ToolParam::required("content", "string", "Note content"),
                ToolParam::optional("tags", "string", "Comma-separated tags"),
            ],
            category: ToolCategory::Memory,
            requires_env: &[],
            handler: handle_kb_write,
        },
        Tool {
            name: "task_create",
            description: "Create a new task on the task board.",
            params: vec![ToolParam::required("description", "string", "Task description")],
            category: ToolCategory::Task,
            requires_env: &[],
            handler: handle_task_create,
        },
        Tool {
            name: "task_status",
            description: "Get task status. Without task_id, lists recent tasks.",
            params: vec![ToolParam::optional("task_id", "string", "Task ID or prefix")],
            category: ToolCategory::Task,
            requires_env: &[],
            handler: handle_task_status,
        },
        Tool {
            name: "send_mail",
            description: "Send a message to another agent's mailbox.",
            params: vec![
                ToolParam::required("to", "string", "Target agent ID"),
                ToolParam::required("content", "string", "Message content"),
                ToolParam::optional("msg_type", "string", "Message type (default: message)"),
            ],
            category: ToolCategory::Messaging,
            requires_env: &[],
            handler: handle_send_mail,
        },
        Tool {
            name: "a2a_delegate",
            description: "Delegate a task to an external A2A agent.",
            params: vec![
                ToolParam::required("agent_url", "string", "Agent URL or 'auto'"),
                ToolParam::required("message", "string", "Task description to send"),
                ToolParam::optional("required_skills", "string", "Comma-separated skill tags"),
                ToolParam::optional("timeout", "integer", "Max wait seconds (default 120)"),
            ],
            category: ToolCategory::A2aDelegate,
            requires_env: &[],
            handler: handle_a2a_delegate,
        },
    ]
}

// ── Handlers ────────────────────────────────────────────────────────────

fn param_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

fn param_i64(params: &Map<String, Value>, key: &str, default: i64) -> i64 {
    params.get(key).and_then(|v| v.as_i64()).unwrap_or(default)
}

fn handle_web_search(_ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let query = param_str(params, "query").ok_or("missing 'query'")?;
    let count = param_i64(params, "count", 5).clamp(1, 10);
    let api_key = std::env::var("BRAVE_API_KEY").map_err(|_| "BRAVE_API_KEY not set")?;

    let client = reqwest::blocking::Client::new();
    let resp: Value = client
        .get("https://api.search.brave.com/res/v1/web/search")
        .query(&[("q", query), ("count", &count.to_string())])
        .header("Accept", "application/json")
        .header("X-Subscription-Token", api_key)
        .timeout(Duration::from_secs(20))
        .send()
        .map_err(|e| format!("search request failed: {e}"))?
        .json()
        .map_err(|e| format!("search response was not JSON: {e}"))?;

    let results: Vec<Value> = resp["web"]["results"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .take(count as usize)
                .map(|r| {
                    json!({
                        "title": r["title"],
                        "url": r["url"],
                        "description": r["description"],
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(json!({"ok": true, "results": results}))
}

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("static regex"));
static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?si)<(script|style)[^>]*>.*?</(script|style)>").expect("static regex"));

fn handle_web_fetch(_ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let url = param_str(params, "url").ok_or("missing 'url'")?;
    let max_chars = param_i64(params, "max_chars", 8000).max(1) as usize;

    let client = reqwest::blocking::Client::new();
    let body = client
        .get(url)
        .header("User-Agent", "Cleo/0.2")
        .timeout(Duration::from_secs(30))
        .send()
        .map_err(|e| format!("fetch failed: {e}"))?
        .text()
        .map_err(|e| format!("body read failed: {e}"))?;

    let stripped = SCRIPT_RE.replace_all(&body, " ");
    let text = TAG_RE.replace_all(&stripped, " ");
    let mut compact = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if compact.len() > max_chars {
        compact = compact.chars().take(max_chars).collect();
    }
    Ok(json!({"ok": true, "url": url, "text": compact}))
}

/// Commands the exec tool will run without an approval entry.
const EXEC_ALLOWLIST: &[&str] = &[
    "ls", "cat ", "head ", "tail ", "grep ", "find ", "wc ", "date", "pwd", "echo ",
    "python3 ", "python ", "node ", "git status", "git log", "git diff",
];

fn handle_exec(ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let command = param_str(params, "command").ok_or("missing 'command'")?.trim();
    let timeout = param_i64(params, "timeout", 120).clamp(1, 600) as u64;

    if !EXEC_ALLOWLIST.iter().any(|p| command.starts_with(p)) {
        return Err(format!("command not in allowlist: {command}"));
    }

    let mut child = std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(ctx.workdir.root())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| format!("spawn failed: {e}"))?;

    let deadline = Instant::now() + Duration::from_secs(timeout);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut stdout = String::new();
                let mut stderr = String::new();
                if let Some(mut out) = child.stdout.take() {
                    let _ = out.read_to_string(&mut stdout);
                }
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_string(&mut stderr);
                }
                return Ok(json!({
                    "ok": status.success(),
                    "exit_code": status.code(),
                    "stdout": truncate_chars(&stdout, 8000),
                    "stderr": truncate_chars(&stderr, 2000),
                }));
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    return Err(format!("command timed out after {timeout}s"));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(format!("wait failed: {e}")),
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect::<String>() + "…[truncated]"
    }
}

fn resolve_in_workdir(ctx: &ToolContext, rel: &str) -> std::path::PathBuf {
    let p = std::path::Path::new(rel);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        ctx.workdir.root().join(rel)
    }
}

fn handle_read_file(ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let path = param_str(params, "path").ok_or("missing 'path'")?;
    let max_lines = param_i64(params, "max_lines", 200).max(1) as usize;
    let full = resolve_in_workdir(ctx, path);
    let raw = std::fs::read_to_string(&full).map_err(|e| format!("read failed: {e}"))?;
    let lines: Vec<&str> = raw.lines().take(max_lines).collect();
    Ok(json!({
        "ok": true,
        "path": path,
        "content": lines.join("\n"),
        "truncated": raw.lines().count() > max_lines,
    }))
}

fn handle_write_file(ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let path = param_str(params, "path").ok_or("missing 'path'")?;
    let content = param_str(params, "content").ok_or("missing 'content'")?;
    let full = resolve_in_workdir(ctx, path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("mkdir failed: {e}"))?;
    }
    std::fs::write(&full, content).map_err(|e| format!("write failed: {e}"))?;
    Ok(json!({"ok": true, "path": path, "bytes": content.len()}))
}

fn handle_list_dir(ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let path = param_str(params, "path").unwrap_or(".");
    let full = resolve_in_workdir(ctx, path);
    let mut entries = Vec::new();
    let iter = std::fs::read_dir(&full).map_err(|e| format!("list failed: {e}"))?;
    for entry in iter.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let kind = if entry.path().is_dir() { "dir" } else { "file" };
        entries.push(json!({"name": name, "type": kind}));
    }
    Ok(json!({"ok": true, "path": path, "entries": entries}))
}

fn handle_edit_file(ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let path = param_str(params, "path").ok_or("missing 'path'")?;
    let old_str = param_str(params, "old_str").ok_or("missing 'old_str'")?;
    let new_str = param_str(params, "new_str").ok_or("missing 'new_str'")?;
    let full = resolve_in_workdir(ctx, path);
    let raw = std::fs::read_to_string(&full).map_err(|e| format!("read failed: {e}"))?;
    let count = raw.matches(old_str).count();
    if count == 0 {
        return Err("old_str not found in file".to_string());
    }
    if count > 1 {
        return Err(format!("old_str matches {count} locations; must be unique"));
    }
    std::fs::write(&full, raw.replacen(old_str, new_str, 1))
        .map_err(|e| format!("write failed: {e}"))?;
    Ok(json!({"ok": true, "path": path}))
}

fn episodes_file(ctx: &ToolContext) -> std::path::PathBuf {
    ctx.workdir.join("memory/episodes.jsonl")
}

fn handle_memory_search(ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let query = param_str(params, "query").ok_or("missing 'query'")?.to_lowercase();
    let limit = param_i64(params, "limit", 5).max(1) as usize;
    let raw = std::fs::read_to_string(episodes_file(ctx)).unwrap_or_default();
    let terms: Vec<&str> = query.split_whitespace().collect();
    let mut hits: Vec<(usize, Value)> = raw
        .lines()
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .filter_map(|case| {
            let haystack = case.to_string().to_lowercase();
            let score = terms.iter().filter(|t| haystack.contains(*t)).count();
            (score > 0).then_some((score, case))
        })
        .collect();
    hits.sort_by(|a, b| b.0.cmp(&a.0));
    let cases: Vec<Value> = hits.into_iter().take(limit).map(|(_, c)| c).collect();
    Ok(json!({"ok": true, "cases": cases}))
}

fn handle_memory_save(ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let problem = param_str(params, "problem").ok_or("missing 'problem'")?;
    let solution = param_str(params, "solution").ok_or("missing 'solution'")?;
    let tags = param_str(params, "tags").unwrap_or("");
    let file = episodes_file(ctx);
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("mkdir failed: {e}"))?;
    }
    let entry = json!({
        "problem": problem,
        "solution": solution,
        "tags": tags.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()).collect::<Vec<_>>(),
        "agent_id": ctx.agent_id,
        "ts": crate::now_ts(),
    });
    let mut line = entry.to_string();
    line.push('\n');
    use std::io::Write as _;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&file)
        .and_then(|mut f| f.write_all(line.as_bytes()))
        .map_err(|e| format!("append failed: {e}"))?;
    Ok(json!({"ok": true}))
}

fn kb_notes_dir(ctx: &ToolContext) -> std::path::PathBuf {
    ctx.workdir.join("memory/kb/notes")
}

fn handle_kb_search(ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let query = param_str(params, "query").ok_or("missing 'query'")?.to_lowercase();
    let limit = param_i64(params, "limit", 5).max(1) as usize;
    let mut notes = Vec::new();
    if let Ok(iter) = std::fs::read_dir(kb_notes_dir(ctx)) {
        for entry in iter.flatten() {
            if notes.len() >= limit {
                break;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let content = std::fs::read_to_string(entry.path()).unwrap_or_default();
            if name.to_lowercase().contains(&query) || content.to_lowercase().contains(&query) {
                notes.push(json!({
                    "name": name,
                    "preview": truncate_chars(&content, 400),
                }));
            }
        }
    }
    Ok(json!({"ok": true, "notes": notes}))
}

fn handle_kb_write(ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let topic = param_str(params, "topic").ok_or("missing 'topic'")?;
    let content = param_str(params, "content").ok_or("missing 'content'")?;
    let tags = param_str(params, "tags").unwrap_or("");
    let slug: String = topic
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let dir = kb_notes_dir(ctx);
    std::fs::create_dir_all(&dir).map_err(|e| format!("mkdir failed: {e}"))?;
    let path = dir.join(format!("{slug}.md"));
    let body = format!("# {topic}\n\ntags: {tags}\n\n{content}\n");
    std::fs::write(&path, body).map_err(|e| format!("write failed: {e}"))?;
    Ok(json!({"ok": true, "note": format!("{slug}.md")}))
}

fn handle_task_create(ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let description = param_str(params, "description").ok_or("missing 'description'")?;
    let board = TaskBoard::new(&ctx.workdir);
    let task = board
        .create_simple(description)
        .map_err(|e| format!("create failed: {e}"))?;
    Ok(json!({"ok": true, "task_id": task.task_id}))
}

fn handle_task_status(ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let board = TaskBoard::new(&ctx.workdir);
    match param_str(params, "task_id") {
        Some(prefix) if !prefix.is_empty() => {
            let matched: Vec<Value> = board
                .all()
                .into_iter()
                .filter(|t| t.task_id.starts_with(prefix))
                .map(|t| {
                    json!({
                        "task_id": t.task_id,
                        "status": t.status.as_str(),
                        "agent_id": t.agent_id,
                        "description": truncate_chars(&t.description, 120),
                    })
                })
                .collect();
            Ok(json!({"ok": true, "tasks": matched}))
        }
        _ => {
            let recent: Vec<Value> = board
                .all()
                .into_iter()
                .rev()
                .take(10)
                .map(|t| {
                    json!({
                        "task_id": t.task_id,
                        "status": t.status.as_str(),
                        "description": truncate_chars(&t.description, 120),
                    })
                })
                .collect();
            Ok(json!({"ok": true, "tasks": recent}))
        }
    }
}

fn handle_send_mail(ctx: &ToolContext, params: &Map<String, Value>) -> Result<Value, String> {
    let to = param_str(params, "to").ok_or("missing 'to'")?;
    let content = param_str(params, "content").ok_or("missing 'content'")?;
    let msg_type = param_str(params, "msg_type").unwrap_or("message");
    Mailbox::new(&ctx.workdir)
        .send(to, &ctx.agent_id, msg_type, content)
        .map_err(|e| format!("send failed: {e}"))?;
    Ok(json!({"ok": true, "to": to, "from": ctx.agent_id}))
}

fn handle_a2a_delegate(_ctx: &ToolContext, _params: &Map<String, Value>) -> Result<Value, String> {
    // Delegation needs the async A2A client; the worker runtime intercepts
    // this call before generic dispatch.
    Err("a2a_delegate is dispatched by the worker runtime".to_string())
}

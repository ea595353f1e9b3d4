//! A2A 0.3 data model, exact wire field names preserved for external
//! compatibility.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cleo::board::TaskStatus;

fn hex12() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    simple.chars().take(12).collect()
}

pub fn new_task_id() -> String {
    format!("a2a-{}", hex12())
}

pub fn new_context_id() -> String {
    format!("ctx-{}", hex12())
}

pub fn new_message_id() -> String {
    format!("msg-{}", hex12())
}

pub fn new_artifact_id() -> String {
    format!("art-{}", hex12())
}

fn iso_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ── Parts ───────────────────────────────────────────────────────────────

/// A message/artifact content unit. Wire discriminator: `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum A2APart {
    Text {
        text: String,
    },
    File {
        #[serde(default)]
        name: String,
        #[serde(rename = "mimeType", default)]
        mime_type: String,
        /// Inline base-64 payload; mutually exclusive with `uri`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uri: Option<String>,
    },
    Data {
        data: Value,
    },
}

impl A2APart {
    pub fn text_part(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn file_part(name: impl Into<String>, mime: impl Into<String>, data: Option<String>, uri: Option<String>) -> Self {
        Self::File {
            name: name.into(),
            mime_type: mime.into(),
            data,
            uri,
        }
    }

    pub fn data_part(data: Value) -> Self {
        Self::Data { data }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }
}

// ── Message ─────────────────────────────────────────────────────────────

/// The primary communication unit. `role` is "user" (client→server) or
/// "agent" (server→client).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct A2AMessage {
    #[serde(default = "default_user_role")]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<A2APart>,
    #[serde(rename = "messageId", default)]
    pub message_id: String,
}

fn default_user_role() -> String {
    "user".to_string()
}

impl A2AMessage {
    pub fn user(parts: Vec<A2APart>) -> Self {
        Self {
            role: "user".to_string(),
            parts,
            message_id: new_message_id(),
        }
    }

    pub fn agent(parts: Vec<A2APart>) -> Self {
        Self {
            role: "agent".to_string(),
            parts,
            message_id: new_message_id(),
        }
    }

    /// Fill a missing message id (auto-generated per the wire contract).
    pub fn ensure_id(&mut self) {
        if self.message_id.is_empty() {
            self.message_id = new_message_id();
        }
    }

    /// Concatenated text from all TextParts.
    pub fn get_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn get_files(&self) -> Vec<&A2APart> {
        self.parts.iter().filter(|p| p.is_file()).collect()
    }
}

// ── Task state ──────────────────────────────────────────────────────────

/// A2A wire task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum A2AState {
    #[serde(rename = "submitted")]
    Submitted,
    #[serde(rename = "working")]
    Working,
    #[serde(rename = "input-required")]
    InputRequired,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    /// Single-L spelling per the A2A spec.
    #[serde(rename = "canceled")]
    Canceled,
}

impl A2AState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input-required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Map an internal board status onto the wire state.
    pub fn from_board_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => Self::Submitted,
            TaskStatus::Claimed
            | TaskStatus::Review
            | TaskStatus::Critique
            | TaskStatus::Blocked
            | TaskStatus::Paused => Self::Working,
            TaskStatus::Completed => Self::Completed,
            TaskStatus::Failed => Self::Failed,
            TaskStatus::Cancelled => Self::Canceled,
        }
    }
}

/// Task status envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct A2ATaskStatus {
    pub state: A2AState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Box<A2AMessage>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
}

impl A2ATaskStatus {
    pub fn new(state: A2AState) -> Self {
        Self {
            state,
            message: None,
            timestamp: iso_now(),
        }
    }

    pub fn with_message(state: A2AState, message: A2AMessage) -> Self {
        Self {
            state,
            message: Some(Box::new(message)),
            timestamp: iso_now(),
        }
    }
}

// ── Artifact ────────────────────────────────────────────────────────────

/// Output of a completed task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct A2AArtifact {
    #[serde(rename = "artifactId")]
    pub artifact_id: String,
    #[serde(default = "default_artifact_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub parts: Vec<A2APart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

fn default_artifact_name() -> String {
    "result".to_string()
}

impl A2AArtifact {
    pub fn text(name: impl Into<String>, description: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            artifact_id: new_artifact_id(),
            name: name.into(),
            description: description.into(),
            parts: vec![A2APart::text_part(text)],
            metadata: None,
        }
    }
}

// ── Task ────────────────────────────────────────────────────────────────

/// The main lifecycle object:
/// submitted → working (↔ input-required) → completed/failed/canceled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct A2ATask {
    pub id: String,
    #[serde(rename = "contextId")]
    pub context_id: String,
    pub status: A2ATaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<A2AArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<A2AMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default = "default_task_kind")]
    pub kind: String,
}

fn default_task_kind() -> String {
    "task".to_string()
}

impl A2ATask {
    pub fn new(state: A2AState) -> Self {
        Self {
            id: new_task_id(),
            context_id: new_context_id(),
            status: A2ATaskStatus::new(state),
            artifacts: Vec::new(),
            history: Vec::new(),
            metadata: None,
            kind: default_task_kind(),
        }
    }

    /// A failed placeholder for unknown ids.
    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context_id: new_context_id(),
            status: A2ATaskStatus::new(A2AState::Failed),
            artifacts: Vec::new(),
            history: Vec::new(),
            metadata: Some(serde_json::json!({"error": error.into()})),
            kind: default_task_kind(),
        }
    }
}

// ── Agent Card ──────────────────────────────────────────────────────────

/// A single capability advertised in the Agent Card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSkill {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentCapabilities {
    pub streaming: bool,
    #[serde(rename = "pushNotifications")]
    pub push_notifications: bool,
    #[serde(rename = "stateTransitionHistory")]
    pub state_transition_history: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentAuthentication {
    pub schemes: Vec<String>,
}

/// Served at `/.well-known/agent.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub url: String,
    pub version: String,
    pub protocol: String,
    pub capabilities: AgentCapabilities,
    pub skills: Vec<AgentSkill>,
    pub authentication: AgentAuthentication,
    #[serde(rename = "defaultInputModes")]
    pub default_input_modes: Vec<String>,
    #[serde(rename = "defaultOutputModes")]
    pub default_output_modes: Vec<String>,
}

impl AgentCard {
    /// Card for this deployment, advertising the local RPC endpoint.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            name: "Cleo".to_string(),
            description: "Self-evolving multi-agent AI system with planning, execution, \
                          and quality review. Tasks are decomposed, executed by a worker \
                          team, and peer-reviewed before synthesis."
                .to_string(),
            url: url.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: "a2a/0.3".to_string(),
            capabilities: AgentCapabilities {
                streaming: true,
                push_notifications: false,
                state_transition_history: true,
            },
            skills: default_skills(),
            authentication: AgentAuthentication {
                schemes: vec!["bearer".to_string()],
            },
            default_input_modes: vec!["text".to_string(), "file".to_string()],
            default_output_modes: vec!["text".to_string(), "file".to_string()],
        }
    }
}

fn default_skills() -> Vec<AgentSkill> {
    vec![
        AgentSkill {
            id: "research".to_string(),
            name: "Web Research & Analysis".to_string(),
            description: "Search the web, fetch pages, analyze content, and synthesize \
                          findings into structured reports."
                .to_string(),
            tags: vec![
                "research".to_string(),
                "web-search".to_string(),
                "analysis".to_string(),
                "report".to_string(),
            ],
            examples: vec![
                "Research the top 5 DeFi protocols on Base chain by TVL".to_string(),
                "Compare Arbitrum vs Optimism ecosystem development".to_string(),
            ],
        },
        AgentSkill {
            id: "coding".to_string(),
            name: "Code Generation & Execution".to_string(),
            description: "Write, execute, and test code with sandboxed execution.".to_string(),
            tags: vec![
                "code".to_string(),
                "programming".to_string(),
                "automation".to_string(),
            ],
            examples: vec![
                "Write a Python script to analyze CSV data".to_string(),
                "Create a web scraper for product prices".to_string(),
            ],
        },
        AgentSkill {
            id: "content".to_string(),
            name: "Content Creation".to_string(),
            description: "Generate structured documents, reports, and analysis. Multi-step \
                          tasks are automatically decomposed, executed, and quality-reviewed."
                .to_string(),
            tags: vec![
                "writing".to_string(),
                "report".to_string(),
                "document".to_string(),
            ],
            examples: vec![
                "Write a competitive analysis report".to_string(),
                "Create a technical specification document".to_string(),
            ],
        },
    ]
}

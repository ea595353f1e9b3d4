//! Structured protocol definitions for all inter-agent communication.
//!
//! Pure data contracts: the planner→executor ticket ([`SubTaskSpec`]), the
//! advisor review ([`CritiqueSpec`]), the stable user-goal anchor
//! ([`IntentAnchor`]), routing decisions, and the feedback-loop output
//! ([`GradientSignal`]).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Visible-text stripper ───────────────────────────────────────────────

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("static regex"));
static TOOL_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<tool_code>.*?</tool_code>").expect("static regex"));
static BLANK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("static regex"));

/// Strip `<think>...</think>` and `<tool_code>...</tool_code>` blocks from
/// model output before publishing visible text.
///
/// If stripping leaves nothing, the think content itself is recovered:
/// some models wrap their entire response in think tags.
pub fn strip_think(text: &str) -> String {
    let think_contents: Vec<String> = THINK_RE
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect();
    let stripped = THINK_RE.replace_all(text, "");
    let stripped = TOOL_CODE_RE.replace_all(&stripped, "");
    let stripped = BLANK_RUN_RE.replace_all(&stripped, "\n\n").trim().to_string();
    if !stripped.is_empty() {
        return stripped;
    }
    let combined = think_contents
        .iter()
        .filter(|c| !c.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n");
    if !combined.is_empty() {
        tracing::info!(
            chars = combined.len(),
            "entire output was <think>; recovering its content"
        );
        return BLANK_RUN_RE.replace_all(&combined, "\n\n").trim().to_string();
    }
    stripped
}

// ── Board ticket markers ────────────────────────────────────────────────

/// Prefix of reviewer tickets minted by the orchestrator:
/// `[review:<target_task_id>] <description preview>`.
pub const REVIEW_MARKER: &str = "[review:";
/// Prefix of the planner close-out ticket: `[closeout] root=<root_task_id>`.
pub const CLOSEOUT_MARKER: &str = "[closeout] root=";

// ── Tool categories ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Web,
    Fs,
    Automation,
    Media,
    Browser,
    Memory,
    Messaging,
    Task,
    Skill,
    /// Delegate to an external A2A agent.
    A2aDelegate,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Fs => "fs",
            Self::Automation => "automation",
            Self::Media => "media",
            Self::Browser => "browser",
            Self::Memory => "memory",
            Self::Messaging => "messaging",
            Self::Task => "task",
            Self::Skill => "skill",
            Self::A2aDelegate => "a2a_delegate",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "web" => Some(Self::Web),
            "fs" => Some(Self::Fs),
            "automation" => Some(Self::Automation),
            "media" => Some(Self::Media),
            "browser" => Some(Self::Browser),
            "memory" => Some(Self::Memory),
            "messaging" => Some(Self::Messaging),
            "task" => Some(Self::Task),
            "skill" => Some(Self::Skill),
            "a2a_delegate" => Some(Self::A2aDelegate),
            _ => None,
        }
    }
}

// ── SubTaskSpec ─────────────────────────────────────────────────────────

/// Hint for delegating a subtask to an external A2A agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct A2aHint {
    /// Recommended external agent URL, or empty.
    #[serde(default)]
    pub preferred_agent: String,
    /// Capability tags the external agent must advertise.
    #[serde(default)]
    pub required_skills: Vec<String>,
    /// Fallback plan when no external agent is available.
    #[serde(default)]
    pub fallback: String,
}

impl A2aHint {
    pub fn is_empty(&self) -> bool {
        self.preferred_agent.is_empty()
            && self.required_skills.is_empty()
            && self.fallback.is_empty()
    }
}

/// Structured task ticket from the planner to an executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubTaskSpec {
    pub objective: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub input: serde_json::Map<String, Value>,
    /// markdown_table / json / code / file / text.
    #[serde(default)]
    pub output_format: String,
    /// Tool category tags, including the sentinel `a2a_delegate`.
    #[serde(default)]
    pub tool_hint: Vec<String>,
    #[serde(default = "default_normal")]
    pub complexity: String,
    /// Raw user message, for cross-subtask anchoring.
    #[serde(default)]
    pub parent_intent: String,
    #[serde(default, skip_serializing_if = "A2aHint::is_empty")]
    pub a2a_hint: A2aHint,
}

fn default_normal() -> String {
    "normal".to_string()
}

impl SubTaskSpec {
    /// Serialize to a board description (human-readable and parseable back).
    pub fn to_task_description(&self) -> String {
        let mut lines = vec![format!("[SubTaskSpec] {}", self.objective)];
        if !self.constraints.is_empty() {
            lines.push(format!("Constraints: {}", self.constraints.join("; ")));
        }
        if !self.output_format.is_empty() {
            lines.push(format!("Output format: {}", self.output_format));
        }
        if !self.tool_hint.is_empty() {
            lines.push(format!("Tool categories: {}", self.tool_hint.join(", ")));
        }
        lines.join("\n")
    }

    /// Construct from a legacy `TASK: <description>` line.
    pub fn from_legacy_task(description: &str, complexity: &str) -> Self {
        Self {
            objective: description.to_string(),
            complexity: complexity.to_string(),
            ..Default::default()
        }
    }

    /// Parse a board description back into a spec. Returns `None` when the
    /// description does not carry a `[SubTaskSpec]` marker.
    pub fn from_task_description(description: &str) -> Option<Self> {
        let mut lines = description.lines();
        let first = lines.next()?.trim();
        let objective = first.strip_prefix("[SubTaskSpec]")?.trim().to_string();
        let mut spec = Self {
            objective,
            ..Default::default()
        };
        for line in lines {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("Constraints:") {
                spec.constraints = rest
                    .split(';')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            } else if let Some(rest) = line.strip_prefix("Output format:") {
                spec.output_format = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("Tool categories:") {
                spec.tool_hint = rest
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
        }
        Some(spec)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("subtask spec serializes")
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

// ── CritiqueSpec ────────────────────────────────────────────────────────

pub const VERDICT_LGTM: &str = "LGTM";
pub const VERDICT_NEEDS_WORK: &str = "NEEDS_WORK";

/// 5-dimension scoring, 1-10 each.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CritiqueDimensions {
    /// Accuracy (30%).
    pub accuracy: i64,
    /// Completeness (20%).
    pub completeness: i64,
    /// Technical quality (20%).
    pub technical: i64,
    /// Calibration (20%).
    pub calibration: i64,
    /// Resource efficiency (10%).
    pub efficiency: i64,
}

impl Default for CritiqueDimensions {
    fn default() -> Self {
        Self {
            accuracy: 7,
            completeness: 7,
            technical: 7,
            calibration: 7,
            efficiency: 7,
        }
    }
}

impl CritiqueDimensions {
    fn scores(&self) -> [i64; 5] {
        [
            self.accuracy,
            self.completeness,
            self.technical,
            self.calibration,
            self.efficiency,
        ]
    }

    /// Weighted composite score (1-10). Weights:
    /// accuracy .30, completeness .20, technical .20, calibration .20,
    /// efficiency .10.
    pub fn composite(&self) -> f64 {
        const WEIGHTS: [f64; 5] = [0.30, 0.20, 0.20, 0.20, 0.10];
        self.scores()
            .iter()
            .zip(WEIGHTS)
            .map(|(score, weight)| *score as f64 * weight)
            .sum()
    }

    pub fn all_high(&self) -> bool {
        self.scores().iter().all(|s| *s >= 8)
    }

    pub fn any_low(&self) -> bool {
        self.scores().iter().any(|s| *s < 5)
    }
}

/// One actionable improvement item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CritiqueItem {
    #[serde(default)]
    pub dimension: String,
    #[serde(default)]
    pub issue: String,
    #[serde(default)]
    pub suggestion: String,
}

/// Provenance of externally-delegated content, for trust-aware scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceTrust {
    #[serde(default)]
    pub agent_url: String,
    #[serde(default)]
    pub trust_level: String,
    #[serde(default)]
    pub data_freshness: String,
    #[serde(default)]
    pub cross_validated: bool,
}

impl SourceTrust {
    pub fn is_empty(&self) -> bool {
        self.agent_url.is_empty() && self.trust_level.is_empty()
    }
}

/// The reviewer's structured output. Advisory: a NEEDS_WORK verdict never
/// gates task completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CritiqueSpec {
    #[serde(default)]
    pub dimensions: CritiqueDimensions,
    #[serde(default = "default_lgtm")]
    pub verdict: String,
    #[serde(default)]
    pub items: Vec<CritiqueItem>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub reviewer_id: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "SourceTrust::is_empty")]
    pub source_trust: SourceTrust,
}

fn default_lgtm() -> String {
    VERDICT_LGTM.to_string()
}

fn default_confidence() -> f64 {
    0.8
}

impl Default for CritiqueSpec {
    fn default() -> Self {
        Self {
            dimensions: CritiqueDimensions::default(),
            verdict: default_lgtm(),
            items: Vec::new(),
            confidence: default_confidence(),
            task_id: String::new(),
            reviewer_id: String::new(),
            timestamp: 0.0,
            source_trust: SourceTrust::default(),
        }
    }
}

impl CritiqueSpec {
    pub fn composite_score(&self) -> f64 {
        self.dimensions.composite()
    }

    /// All dimensions ≥ 8 → force LGTM and clear the item list.
    pub fn auto_simplify(&mut self) {
        if self.dimensions.all_high() {
            self.verdict = VERDICT_LGTM.to_string();
            self.items.clear();
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == VERDICT_LGTM
    }

    /// Construct from a flat legacy score.
    pub fn from_legacy_score(score: i64, suggestions: &[String], timestamp: f64) -> Self {
        let mut spec = Self {
            dimensions: CritiqueDimensions {
                accuracy: score,
                completeness: score,
                technical: score,
                calibration: score,
                efficiency: score,
            },
            items: suggestions
                .iter()
                .take(3)
                .map(|s| CritiqueItem {
                    suggestion: s.clone(),
                    ..Default::default()
                })
                .collect(),
            timestamp,
            ..Default::default()
        };
        spec.auto_simplify();
        spec
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("critique spec serializes")
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

// ── Routing ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteDecision {
    #[serde(rename = "DIRECT_ANSWER")]
    DirectAnswer,
    #[serde(rename = "MAS_PIPELINE")]
    MasPipeline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResult {
    pub decision: RouteDecision,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub direct_answer: String,
    #[serde(default)]
    pub subtask_specs: Vec<SubTaskSpec>,
}

impl Default for RoutingResult {
    fn default() -> Self {
        Self {
            decision: RouteDecision::MasPipeline,
            reason: String::new(),
            direct_answer: String::new(),
            subtask_specs: Vec::new(),
        }
    }
}

// ── IntentAnchor ────────────────────────────────────────────────────────

/// Stable record of user intent; written once at submission and refined
/// once by the planner after decomposition, read at every close-out.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IntentAnchor {
    pub user_message: String,
    #[serde(default)]
    pub core_goal: String,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub task_id: String,
}

// ── GradientSignal ──────────────────────────────────────────────────────

/// Recurring issues and improvement patches extracted from the critique
/// log by the TextGrad pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GradientSignal {
    pub agent_id: String,
    #[serde(default)]
    pub recurring_issues: Vec<String>,
    #[serde(default)]
    pub improvement_patches: Vec<String>,
    #[serde(default)]
    pub source_critique_ids: Vec<String>,
    #[serde(default)]
    pub generated_at: f64,
    #[serde(default)]
    pub decayed_issues: Vec<String>,
}

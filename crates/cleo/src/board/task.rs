//! Task record and status types persisted in the board document.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::now_ts;

/// Lifecycle states of a board task.
///
/// Terminal states are `Completed`, `Failed`, `Cancelled`; a terminal task
/// only re-enters `Pending` through an explicit `retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Claimed,
    /// Waiting for peer review.
    Review,
    /// Advisor gave fix suggestions, awaiting executor revision.
    Critique,
    Completed,
    Failed,
    /// Waiting for a dependency.
    Blocked,
    /// User-cancelled.
    Cancelled,
    /// User-paused (resumable).
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Review => "review",
            Self::Critique => "critique",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }

    /// Decode a wire string. Unknown values from older data coerce to
    /// `Pending` rather than failing the whole document.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "claimed" => Self::Claimed,
            "review" => Self::Review,
            "critique" => Self::Critique,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "blocked" => Self::Blocked,
            "cancelled" => Self::Cancelled,
            "paused" => Self::Paused,
            other => {
                tracing::warn!(status = other, "unknown task status; coercing to pending");
                Self::Pending
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active states block global quiescence.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::Claimed
                | Self::Review
                | Self::Critique
                | Self::Blocked
                | Self::Paused
        )
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&raw))
    }
}

/// A legacy simple review score appended by `add_review`. Advisory only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewScore {
    pub reviewer: String,
    pub score: i64,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub ts: f64,
}

/// The most recent structured critique attached by `add_critique`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CritiqueRecord {
    pub reviewer: String,
    pub passed: bool,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub ts: f64,
}

/// One task on the board.
///
/// Unknown fields from newer writers are dropped on load; missing fields
/// take their defaults so documents written by older runs keep loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub min_reputation: i64,
    #[serde(default)]
    pub required_role: Option<String>,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub claimed_at: Option<f64>,
    #[serde(default)]
    pub completed_at: Option<f64>,
    #[serde(default)]
    pub review_submitted_at: Option<f64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub review_scores: Vec<ReviewScore>,
    #[serde(default)]
    pub evolution_flags: Vec<String>,
    #[serde(default = "default_complexity")]
    pub complexity: String,
    #[serde(default)]
    pub critique: Option<CritiqueRecord>,
    #[serde(default)]
    pub critique_round: u32,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Streaming preview; non-authoritative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_result: Option<String>,
    /// Running accumulated cost estimate.
    #[serde(default)]
    pub cost_usd: f64,
    /// Status before `pause`, so dashboards can show what was interrupted.
    #[serde(rename = "_paused_from", default, skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<String>,
}

fn default_complexity() -> String {
    "normal".to_string()
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            status: TaskStatus::Pending,
            agent_id: None,
            result: None,
            blocked_by: Vec::new(),
            min_reputation: 0,
            required_role: None,
            created_at: now_ts(),
            claimed_at: None,
            completed_at: None,
            review_submitted_at: None,
            retry_count: 0,
            review_scores: Vec::new(),
            evolution_flags: Vec::new(),
            complexity: default_complexity(),
            critique: None,
            critique_round: 0,
            parent_id: None,
            partial_result: None,
            cost_usd: 0.0,
            paused_from: None,
        }
    }

    /// Average legacy review score; no review counts as a pass.
    pub fn avg_review_score(&self) -> f64 {
        if self.review_scores.is_empty() {
            return 100.0;
        }
        let sum: i64 = self.review_scores.iter().map(|r| r.score).sum();
        sum as f64 / self.review_scores.len() as f64
    }
}

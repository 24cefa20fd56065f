use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One per completed turn; the unit of satisfaction measurement.
#[derive(Debug, Clone, Serialize)]
pub struct Interaction {
    pub id: String,
    pub user_id: String,
    pub request_text: String,
    pub response_text: String,
    pub response_time_ms: u64,
    pub task_completed: bool,
    pub engagement_duration_ms: Option<u64>,
    pub follow_up_in_60s: Option<bool>,
    pub context: serde_json::Value,
    pub created_at: String,
}

/// Fields the orchestrator provides when persisting a turn.
#[derive(Debug, Clone)]
pub struct NewInteraction {
    pub user_id: String,
    pub request_text: String,
    pub response_text: String,
    pub response_time_ms: u64,
    pub task_completed: bool,
    pub engagement_duration_ms: Option<u64>,
    pub follow_up_in_60s: Option<bool>,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Rating,
    Thumbs,
    Text,
    Implicit,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Rating => "rating",
            FeedbackKind::Thumbs => "thumbs",
            FeedbackKind::Text => "text",
            FeedbackKind::Implicit => "implicit",
        }
    }
}

impl FromStr for FeedbackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rating" => Ok(FeedbackKind::Rating),
            "thumbs" => Ok(FeedbackKind::Thumbs),
            "text" => Ok(FeedbackKind::Text),
            "implicit" => Ok(FeedbackKind::Implicit),
            other => Err(format!("unknown feedback kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Feedback {
    pub id: String,
    pub user_id: String,
    pub interaction_id: String,
    pub kind: FeedbackKind,
    pub value: Option<f64>,
    pub text: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Flat,
    Declining,
}

/// Aggregates recomputed lazily on read; nothing is cached.
#[derive(Debug, Clone, Serialize)]
pub struct SatisfactionStats {
    pub interaction_count: u64,
    pub completed_count: u64,
    pub completion_rate: f64,
    pub avg_response_ms: f64,
    /// Normalized to [0,1] over rating and thumbs feedback; `None` when no
    /// scoreable feedback exists.
    pub avg_satisfaction: Option<f64>,
    pub feedback_count: u64,
    pub trend: Trend,
}

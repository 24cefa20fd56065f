use std::str::FromStr;

use serde::{Deserialize, Serialize};

use maia_core::types::ContextType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeStatus {
    Active,
    Closed,
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Active => "active",
            EpisodeStatus::Closed => "closed",
        }
    }
}

impl FromStr for EpisodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EpisodeStatus::Active),
            "closed" => Ok(EpisodeStatus::Closed),
            other => Err(format!("unknown episode status '{other}'")),
        }
    }
}

/// A bounded conversational window for one user in one context.
#[derive(Debug, Clone, Serialize)]
pub struct Episode {
    pub id: String,
    pub user_id: String,
    pub context_type: ContextType,
    pub started_at: String,
    pub last_activity_at: String,
    pub status: EpisodeStatus,
    pub timeout_minutes: i64,
    pub message_count: u32,
    pub summary: Option<String>,
}

/// One user message paired with the assistant's response. Append-only.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub id: String,
    pub episode_id: String,
    pub user_text: String,
    pub assistant_text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Person,
    Project,
    General,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Person => "person",
            SubjectKind::Project => "project",
            SubjectKind::General => "general",
        }
    }
}

impl FromStr for SubjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "person" => Ok(SubjectKind::Person),
            "project" => Ok(SubjectKind::Project),
            "general" => Ok(SubjectKind::General),
            other => Err(format!("unknown subject kind '{other}'")),
        }
    }
}

/// A long-term, searchable piece of knowledge about one user.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryFact {
    pub id: i64,
    pub user_id: String,
    pub subject_kind: SubjectKind,
    pub subject_id: Option<String>,
    pub text: String,
    pub importance: f64,
    pub created_at: String,
    pub last_accessed_at: String,
    pub access_count: u32,
}

/// A fact together with its decay-weighted retrieval score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredFact {
    pub fact: MemoryFact,
    pub score: f64,
}

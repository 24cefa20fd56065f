//! `journal` expert: journal entries via the journal router.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use maia_core::error::ErrorKind;
use maia_core::types::TurnContext;
use maia_outbound::{OutboundClient, Service};

use crate::experts::{clean_text, keyword_score};
use crate::{ActionRecord, ActionResult, Expert, ExpertDescriptor};

const STRONG: &[&str] = &["journal", "diary", "dear diary"];
const WEAK: &[&str] = &["write down", "log that"];

static CONTENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:journal|diary|write down|log)\s*(?:that|entry:?)?\s*(.*)$")
        .expect("static regex")
});

/// Light mood detection stored alongside the entry when obvious.
const MOODS: &[(&str, &str)] = &[
    ("great", "happy"),
    ("happy", "happy"),
    ("excited", "happy"),
    ("good day", "happy"),
    ("sad", "sad"),
    ("tired", "tired"),
    ("stressed", "stressed"),
    ("anxious", "stressed"),
];

pub struct JournalExpert {
    outbound: Arc<OutboundClient>,
}

impl JournalExpert {
    pub fn new(outbound: Arc<OutboundClient>) -> Self {
        Self { outbound }
    }

    fn extract_content(query: &str) -> Option<String> {
        let raw = CONTENT_RE.captures(query).map(|caps| caps[1].to_string())?;
        let content = clean_text(&raw, 4000);
        if content.is_empty() {
            None
        } else {
            Some(content)
        }
    }

    fn detect_mood(lower: &str) -> Option<&'static str> {
        MOODS
            .iter()
            .find(|(cue, _)| lower.contains(cue))
            .map(|(_, mood)| *mood)
    }
}

#[async_trait]
impl Expert for JournalExpert {
    fn name(&self) -> &'static str {
        "journal"
    }

    fn descriptor(&self) -> ExpertDescriptor {
        ExpertDescriptor {
            name: "journal",
            capabilities: vec!["journal.create"],
            pattern_hints: STRONG.to_vec(),
            default_confidence: 0.85,
        }
    }

    fn can_handle(&self, query: &str) -> f32 {
        keyword_score(&query.to_lowercase(), STRONG, WEAK)
    }

    async fn execute(&self, query: &str, ctx: &TurnContext) -> ActionResult {
        let Some(content) = Self::extract_content(query) else {
            return ActionResult::failed(
                ErrorKind::Invalid("empty journal entry".to_string()),
                "I couldn't tell what to write in your journal",
            );
        };

        let mut body = json!({ "content": content, "user_id": ctx.user_id });
        if let Some(mood) = Self::detect_mood(&query.to_lowercase()) {
            body["mood"] = json!(mood);
        }

        match self
            .outbound
            .post(Service::Journal, "/api/journal/", body.clone())
            .await
        {
            Ok(resp) => ActionResult::ok("Added that to your journal")
                .with_artifact(json!({ "entry": resp }))
                .with_action(ActionRecord::ok("journal.create", body))
                .with_side_effects(),
            Err(e) => ActionResult::failed(e, "Couldn't write to your journal right now")
                .with_action(ActionRecord::failed("journal.create", body)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_journal_queries_high() {
        assert!(keyword_score("journal that today was a great day", STRONG, WEAK) >= 0.9);
        assert!(keyword_score("turn on the lights", STRONG, WEAK) < 0.5);
    }

    #[test]
    fn extracts_entry_content() {
        assert_eq!(
            JournalExpert::extract_content("journal that today was a great day").as_deref(),
            Some("today was a great day")
        );
        assert_eq!(JournalExpert::extract_content("open my journal"), None);
    }

    #[test]
    fn detects_obvious_moods() {
        assert_eq!(JournalExpert::detect_mood("today was a great day"), Some("happy"));
        assert_eq!(JournalExpert::detect_mood("i feel stressed"), Some("stressed"));
        assert_eq!(JournalExpert::detect_mood("neutral text"), None);
    }
}

//! `memory` expert: stores and searches long-term facts in the local fact
//! store (the owner of the shared memory-fact table).

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use maia_core::error::ErrorKind;
use maia_core::types::TurnContext;
use maia_memory::{MemoryManager, SubjectKind};

use crate::experts::{clean_text, keyword_score};
use crate::{ActionRecord, ActionResult, Expert, ExpertDescriptor};

const STRONG: &[&str] = &[
    "remember that",
    "remember i",
    "remember my",
    "don't forget that",
    "dont forget that",
    "do you remember",
];
const WEAK: &[&str] = &["what do i", "do i like", "what kind of", "what's my", "whats my"];

static STORE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:remember|don'?t forget)\s+(?:that\s+)?(.+)$").expect("static regex")
});

/// Importance assigned to facts stored on explicit request.
const EXPLICIT_IMPORTANCE: f64 = 7.0;
const SEARCH_LIMIT: usize = 5;

pub struct MemoryExpert {
    memory: Arc<MemoryManager>,
}

impl MemoryExpert {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }

    fn extract_fact(query: &str) -> Option<String> {
        let raw = STORE_RE.captures(query).map(|caps| caps[1].to_string())?;
        let fact = clean_text(&raw, 1000);
        if fact.is_empty() {
            None
        } else {
            Some(fact)
        }
    }

    fn store(&self, fact: &str, ctx: &TurnContext) -> ActionResult {
        match self.memory.remember_fact(
            &ctx.user_id,
            SubjectKind::General,
            None,
            fact,
            EXPLICIT_IMPORTANCE,
        ) {
            Ok(fact_id) => ActionResult::ok(format!("I'll remember that {fact}"))
                .with_artifact(json!({ "fact_id": fact_id, "text": fact }))
                .with_action(ActionRecord::ok("memory.store", json!({ "text": fact })))
                .with_side_effects(),
            Err(e) => ActionResult::failed(
                ErrorKind::from(e),
                "Couldn't store that right now",
            )
            .with_action(ActionRecord::failed("memory.store", json!({ "text": fact }))),
        }
    }

    fn search(&self, query: &str, ctx: &TurnContext) -> ActionResult {
        match self.memory.search_facts(&ctx.user_id, query, SEARCH_LIMIT) {
            Ok(hits) if hits.is_empty() => {
                ActionResult::ok("I don't have anything stored about that")
                    .with_action(ActionRecord::ok("memory.search", json!({ "query": query })))
            }
            Ok(hits) => {
                let lines: Vec<String> =
                    hits.iter().map(|h| h.fact.text.clone()).collect();
                let mut result = ActionResult::ok(format!(
                    "From what you've told me: {}",
                    lines.join("; ")
                ));
                for hit in &hits {
                    result = result.with_artifact(json!({
                        "fact_id": hit.fact.id,
                        "text": hit.fact.text,
                        "score": hit.score,
                    }));
                }
                result.with_action(ActionRecord::ok("memory.search", json!({ "query": query })))
            }
            Err(e) => ActionResult::failed(
                ErrorKind::from(e),
                "Couldn't search your memory right now",
            )
            .with_action(ActionRecord::failed("memory.search", json!({ "query": query }))),
        }
    }
}

#[async_trait]
impl Expert for MemoryExpert {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn descriptor(&self) -> ExpertDescriptor {
        ExpertDescriptor {
            name: "memory",
            capabilities: vec!["memory.store", "memory.search"],
            pattern_hints: STRONG.to_vec(),
            default_confidence: 0.85,
        }
    }

    fn can_handle(&self, query: &str) -> f32 {
        keyword_score(&query.to_lowercase(), STRONG, WEAK)
    }

    async fn execute(&self, query: &str, ctx: &TurnContext) -> ActionResult {
        let lower = query.to_lowercase();
        let asking = lower.contains("do you remember")
            || WEAK.iter().any(|p| lower.contains(p))
            || lower.ends_with('?');

        if !asking {
            if let Some(fact) = Self::extract_fact(query) {
                return self.store(&fact, ctx);
            }
        }
        self.search(query, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maia_core::config::EpisodeConfig;
    use maia_core::types::Session;
    use rusqlite::Connection;
    use std::time::Duration;

    fn expert() -> MemoryExpert {
        let conn = Connection::open_in_memory().unwrap();
        MemoryExpert::new(Arc::new(
            MemoryManager::new(conn, EpisodeConfig::default()).unwrap(),
        ))
    }

    fn ctx() -> TurnContext {
        TurnContext::new(Session::local_dev_default(), Duration::from_secs(30))
    }

    #[test]
    fn scores_remember_queries_high() {
        assert!(keyword_score("remember that i prefer oat milk", STRONG, WEAK) >= 0.9);
        assert!(keyword_score("what kind of milk do i like?", STRONG, WEAK) >= 0.5);
        assert!(keyword_score("schedule a meeting", STRONG, WEAK) < 0.5);
    }

    #[test]
    fn extracts_the_fact_text() {
        assert_eq!(
            MemoryExpert::extract_fact("Remember that I prefer oat milk").as_deref(),
            Some("I prefer oat milk")
        );
    }

    #[tokio::test]
    async fn store_then_recall_round_trips() {
        let e = expert();
        let ctx = ctx();

        let stored = e.execute("Remember that I prefer oat milk", &ctx).await;
        assert!(stored.success);
        assert!(stored.caused_side_effects);

        let recalled = e.execute("What kind of milk do I like?", &ctx).await;
        assert!(recalled.success);
        assert!(recalled.summary.contains("oat milk"));
        assert!(!recalled.caused_side_effects);
    }

    #[tokio::test]
    async fn recall_with_nothing_stored_is_graceful() {
        let e = expert();
        let result = e.execute("What do I like?", &ctx()).await;
        assert!(result.success);
        assert!(result.artifacts.is_empty());
    }
}

//! Episode summarization: a fixed prompt against the LLM gateway, stored on
//! the episode row. Fire-and-forget: a failed summary never affects a turn.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use maia_core::error::ErrorKind;
use maia_llm::{EngineRouter, GenerationRequest};
use maia_memory::sweeper::Summarizer;
use maia_memory::MemoryManager;

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize conversations between a user and their \
personal assistant. Write a plain-text summary of at most 300 words covering what the user \
asked for, what was done, and any preferences or facts worth keeping.";

/// [`Summarizer`] backed by the engine router; shared by the episode sweeper
/// and the in-turn threshold trigger.
pub struct LlmSummarizer {
    llm: Arc<EngineRouter>,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<EngineRouter>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, transcript: &str) -> Result<String, ErrorKind> {
        let req = GenerationRequest {
            model: self.llm.default_model().to_string(),
            system_prompt: SUMMARY_SYSTEM_PROMPT.to_string(),
            prompt: transcript.to_string(),
            max_tokens: 512,
            temperature: 0.3,
            stop: Vec::new(),
        };
        self.llm.complete(req).await.map_err(ErrorKind::from)
    }
}

/// Summarize an episode in the background once its turn count crosses the
/// threshold.
pub fn spawn_episode_summary(
    memory: Arc<MemoryManager>,
    llm: Arc<EngineRouter>,
    episode_id: String,
) {
    tokio::spawn(async move {
        let transcript = match memory.episode_transcript(&episode_id) {
            Ok(t) if !t.is_empty() => t,
            Ok(_) => return,
            Err(e) => {
                warn!(episode_id = %episode_id, "transcript read failed: {e}");
                return;
            }
        };
        let summarizer = LlmSummarizer::new(llm);
        match summarizer.summarize(&transcript).await {
            Ok(summary) => {
                if let Err(e) = memory.store_summary(&episode_id, &summary) {
                    warn!(episode_id = %episode_id, "summary store failed: {e}");
                } else {
                    debug!(episode_id = %episode_id, "episode summarized");
                }
            }
            Err(e) => warn!(episode_id = %episode_id, err = %e, "summarization failed"),
        }
    });
}

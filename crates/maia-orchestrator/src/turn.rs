//! The per-turn state machine:
//! `Auth → OpenEpisode → Dispatch → Compose → Generate → Persist → Done`,
//! with errors after Compose degrading into a best-effort response instead
//! of failing the turn.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use maia_core::config::MAX_QUERY_BYTES;
use maia_core::error::ErrorKind;
use maia_core::types::{ContextType, TurnContext};
use maia_experts::{DispatchResult, Dispatcher};
use maia_llm::{EngineRouter, GenerationRequest, TokenEvent};
use maia_memory::manager::SUMMARY_THRESHOLD;
use maia_memory::MemoryManager;
use maia_satisfaction::{FeedbackKind, NewInteraction, SatisfactionTracker};

use crate::prompt::{self, PromptInputs, DEFAULT_BUDGET_CHARS};
use crate::summarize::spawn_episode_summary;

/// How many recent turns and memory facts feed the prompt.
const RECENT_TURNS: usize = 5;
const TOP_FACTS: usize = 5;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClientSignals {
    pub engagement_duration_ms: Option<u64>,
    pub follow_up_in_60s: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub message: String,
    pub context_type: ContextType,
    pub model: Option<String>,
    pub client_signals: ClientSignals,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub response: String,
    pub interaction_id: String,
    pub episode_id: String,
    pub executed_experts: Vec<String>,
    pub partial: bool,
    pub response_time_ms: u64,
}

/// Events emitted on the streaming path, serialized straight into SSE data
/// lines. The `end` event always fires, even after an error.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEvent {
    Token {
        value: String,
    },
    End {
        interaction_id: String,
        episode_id: String,
        executed_experts: Vec<String>,
        partial: bool,
    },
    Error {
        kind: ErrorKind,
    },
}

/// Configured generation knobs applied to every turn. The engine router
/// still clamps them into their hard ranges.
#[derive(Debug, Clone, Copy)]
pub struct GenerationDefaults {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
        }
    }
}

pub struct Orchestrator {
    memory: Arc<MemoryManager>,
    dispatcher: Arc<Dispatcher>,
    llm: Arc<EngineRouter>,
    satisfaction: Arc<SatisfactionTracker>,
    generation: GenerationDefaults,
}

impl Orchestrator {
    pub fn new(
        memory: Arc<MemoryManager>,
        dispatcher: Arc<Dispatcher>,
        llm: Arc<EngineRouter>,
        satisfaction: Arc<SatisfactionTracker>,
        generation: GenerationDefaults,
    ) -> Self {
        Self {
            memory,
            dispatcher,
            llm,
            satisfaction,
            generation,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run one non-streaming turn. Errors before Compose surface as typed
    /// errors; everything after Compose degrades into a response body.
    pub async fn run_turn(
        &self,
        req: TurnRequest,
        ctx: &TurnContext,
    ) -> Result<TurnOutcome, ErrorKind> {
        let started = Instant::now();
        let prepared = self.prepare(&req, ctx).await?;

        let (response, generated_ok) = match self
            .llm
            .complete(self.generation_request(&prepared))
            .await
        {
            Ok(text) => (self.finalize_text(text, &prepared), true),
            Err(e) => {
                warn!(user_id = %ctx.user_id, err = %e, "generation failed, degrading");
                (degraded_response(&prepared.dispatch), false)
            }
        };

        let outcome = self
            .persist(&req, ctx, prepared, response, generated_ok, started)
            .await;
        Ok(outcome)
    }

    /// Run one streaming turn. Tokens flow through `events`; the final `End`
    /// event fires even when the stream breaks mid-way.
    pub async fn run_turn_stream(
        &self,
        req: TurnRequest,
        ctx: &TurnContext,
        events: mpsc::Sender<ChatEvent>,
    ) -> Result<TurnOutcome, ErrorKind> {
        let started = Instant::now();
        let prepared = self.prepare(&req, ctx).await?;

        // Partial-failure acknowledgment leads the stream so the user sees it
        // before the model's own words.
        let preamble = partial_preamble(&prepared.dispatch);
        if let Some(sentence) = &preamble {
            let _ = events
                .send(ChatEvent::Token {
                    value: sentence.clone(),
                })
                .await;
        }

        let (token_tx, mut token_rx) = mpsc::channel::<TokenEvent>(32);
        let gen_req = self.generation_request(&prepared);
        let llm = self.llm.clone();
        let producer = tokio::spawn(async move { llm.stream(gen_req, token_tx).await });

        let mut text = String::new();
        let mut stream_failed = false;
        while let Some(event) = token_rx.recv().await {
            match event {
                TokenEvent::Token { text: t } => {
                    text.push_str(&t);
                    if events.send(ChatEvent::Token { value: t }).await.is_err() {
                        // Client went away: cancel downstream work. In-flight
                        // writes still complete in persist().
                        ctx.cancel.cancel();
                    }
                }
                TokenEvent::Done => break,
                TokenEvent::Error { message } => {
                    warn!(user_id = %ctx.user_id, %message, "stream failed, degrading");
                    stream_failed = true;
                    let _ = events
                        .send(ChatEvent::Error {
                            kind: ErrorKind::Unavailable(message),
                        })
                        .await;
                    break;
                }
            }
        }
        let _ = producer.await;

        let generated_ok = !stream_failed && !text.is_empty();
        let response = if generated_ok {
            match preamble {
                Some(sentence) => format!("{sentence}{text}"),
                None => text,
            }
        } else {
            degraded_response(&prepared.dispatch)
        };

        let outcome = self
            .persist(&req, ctx, prepared, response, generated_ok, started)
            .await;

        let _ = events
            .send(ChatEvent::End {
                interaction_id: outcome.interaction_id.clone(),
                episode_id: outcome.episode_id.clone(),
                executed_experts: outcome.executed_experts.clone(),
                partial: outcome.partial,
            })
            .await;
        Ok(outcome)
    }

    // ── pipeline stages ──────────────────────────────────────────────────────

    /// Auth has already happened (the session rides in `ctx`); this covers
    /// validation, OpenEpisode, the concurrent Dispatch and memory search,
    /// and Compose.
    async fn prepare(
        &self,
        req: &TurnRequest,
        ctx: &TurnContext,
    ) -> Result<PreparedTurn, ErrorKind> {
        let message = req.message.trim();
        if message.is_empty() {
            return Err(ErrorKind::Invalid("message must not be empty".to_string()));
        }
        if req.message.len() > MAX_QUERY_BYTES {
            return Err(ErrorKind::Invalid(format!(
                "message exceeds {MAX_QUERY_BYTES} bytes"
            )));
        }
        // Resolve the model up front: a bad model name is a client error,
        // not something to degrade over after the prompt is composed.
        let model = self
            .llm
            .resolve_model(req.model.as_deref())
            .map_err(ErrorKind::from)?;

        let episode = self
            .memory
            .get_or_open(&ctx.user_id, req.context_type)
            .await
            .map_err(ErrorKind::from)?;

        // Expert dispatch and memory search run concurrently; both must
        // finish before the prompt is composed.
        let (dispatch, facts) = tokio::join!(self.dispatcher.dispatch(message, ctx), async {
            self.memory
                .search_facts(&ctx.user_id, message, TOP_FACTS)
                .unwrap_or_else(|e| {
                    warn!(user_id = %ctx.user_id, "fact search failed: {e}");
                    Vec::new()
                })
        });

        let recent = self
            .memory
            .recent_turns(&episode.id, RECENT_TURNS)
            .unwrap_or_default();

        let expert_lines = dispatch.summary_lines();
        let composed = prompt::compose(
            &PromptInputs {
                recent_turns: &recent,
                facts: &facts,
                expert_lines: &expert_lines,
                user_message: message,
            },
            DEFAULT_BUDGET_CHARS,
        );

        info!(
            user_id = %ctx.user_id,
            episode_id = %episode.id,
            experts = ?dispatch.executed_experts,
            partial = dispatch.partial,
            "turn prepared"
        );

        Ok(PreparedTurn {
            episode_id: episode.id,
            message: message.to_string(),
            model,
            dispatch,
            composed,
        })
    }

    fn generation_request(&self, prepared: &PreparedTurn) -> GenerationRequest {
        GenerationRequest {
            model: prepared.model.clone(),
            system_prompt: prepared.composed.system_prompt.clone(),
            prompt: prepared.composed.prompt.clone(),
            max_tokens: self.generation.max_tokens,
            temperature: self.generation.temperature,
            stop: Vec::new(),
        }
    }

    fn finalize_text(&self, text: String, prepared: &PreparedTurn) -> String {
        match partial_preamble(&prepared.dispatch) {
            Some(sentence) => format!("{sentence}{text}"),
            None => text,
        }
    }

    /// Persist: append the turn, write exactly one interaction, store any
    /// implicit feedback, and kick off summarization at the threshold.
    async fn persist(
        &self,
        req: &TurnRequest,
        ctx: &TurnContext,
        prepared: PreparedTurn,
        response: String,
        generated_ok: bool,
        started: Instant,
    ) -> TurnOutcome {
        match self
            .memory
            .append_turn(&prepared.episode_id, &prepared.message, &response)
            .await
        {
            Ok(episode) => {
                if episode.message_count == SUMMARY_THRESHOLD && episode.summary.is_none() {
                    spawn_episode_summary(self.memory.clone(), self.llm.clone(), episode.id);
                }
            }
            Err(e) => error!(episode_id = %prepared.episode_id, "append_turn failed: {e}"),
        }

        let task_completed = generated_ok && !prepared.dispatch.partial;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let interaction_id = match self.satisfaction.record_interaction(NewInteraction {
            user_id: ctx.user_id.clone(),
            request_text: prepared.message.clone(),
            response_text: response.clone(),
            response_time_ms,
            task_completed,
            engagement_duration_ms: req.client_signals.engagement_duration_ms,
            follow_up_in_60s: req.client_signals.follow_up_in_60s,
            context: json!({
                "episode_id": prepared.episode_id,
                "executed_experts": prepared.dispatch.executed_experts,
                "partial": prepared.dispatch.partial,
                "correlation_id": ctx.correlation_id,
            }),
        }) {
            Ok(id) => id,
            Err(e) => {
                error!(user_id = %ctx.user_id, "interaction write failed: {e}");
                String::new()
            }
        };

        // Bounded implicit feedback: at most one row per turn.
        if !interaction_id.is_empty() {
            if let Some(ms) = req.client_signals.engagement_duration_ms {
                let _ = self.satisfaction.record_feedback(
                    &ctx.user_id,
                    &interaction_id,
                    FeedbackKind::Implicit,
                    Some(ms as f64),
                    None,
                );
            }
        }

        TurnOutcome {
            response,
            interaction_id,
            episode_id: prepared.episode_id,
            executed_experts: prepared.dispatch.executed_experts,
            partial: prepared.dispatch.partial,
            response_time_ms,
        }
    }
}

struct PreparedTurn {
    episode_id: String,
    message: String,
    model: String,
    dispatch: DispatchResult,
    composed: prompt::ComposedPrompt,
}

/// One sentence acknowledging a partial dispatch, prepended to the response.
fn partial_preamble(dispatch: &DispatchResult) -> Option<String> {
    if !dispatch.partial {
        return None;
    }
    let failed: Vec<&str> = dispatch
        .results
        .iter()
        .filter(|o| {
            o.result
                .error
                .as_ref()
                .map(|e| e.marks_partial())
                .unwrap_or(false)
        })
        .map(|o| o.expert.as_str())
        .collect();
    Some(format!(
        "Heads up: I couldn't reach the {} service this time. ",
        failed.join(" and ")
    ))
}

/// Static fallback when generation fails: name what succeeded, one line per
/// expert in dispatcher order, and apologize for the missing reply.
fn degraded_response(dispatch: &DispatchResult) -> String {
    let succeeded: Vec<String> = dispatch
        .results
        .iter()
        .filter(|o| o.result.success)
        .map(|o| o.result.summary.clone())
        .collect();

    if succeeded.is_empty() {
        "I'm having trouble forming a reply right now. Please try again in a moment."
            .to_string()
    } else {
        format!(
            "{}, but I couldn't form a full reply right now.",
            succeeded.join(". ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maia_core::config::{EpisodeConfig, ExpertsConfig};
    use maia_core::types::Session;
    use maia_experts::{ActionLogger, ActionResult, Expert, ExpertDescriptor};
    use maia_llm::{EngineError, LlmEngine};
    use rusqlite::Connection;
    use std::time::Duration;

    struct EchoEngine;

    #[async_trait]
    impl LlmEngine for EchoEngine {
        fn name(&self) -> &str {
            "echo"
        }
        async fn complete(&self, req: &GenerationRequest) -> Result<String, EngineError> {
            Ok(format!("echo: {}", req.prompt.lines().last().unwrap_or("")))
        }
    }

    struct DeadEngine;

    #[async_trait]
    impl LlmEngine for DeadEngine {
        fn name(&self) -> &str {
            "dead"
        }
        async fn complete(&self, _req: &GenerationRequest) -> Result<String, EngineError> {
            Err(EngineError::Unavailable("down".to_string()))
        }
    }

    struct StubExpert {
        score: f32,
        result: ActionResult,
    }

    #[async_trait]
    impl Expert for StubExpert {
        fn name(&self) -> &'static str {
            "list"
        }
        fn descriptor(&self) -> ExpertDescriptor {
            ExpertDescriptor {
                name: "list",
                capabilities: vec![],
                pattern_hints: vec![],
                default_confidence: self.score,
            }
        }
        fn can_handle(&self, _query: &str) -> f32 {
            self.score
        }
        async fn execute(&self, _query: &str, _ctx: &TurnContext) -> ActionResult {
            self.result.clone()
        }
    }

    fn orchestrator_with(
        engine: Arc<dyn LlmEngine>,
        experts: Vec<Arc<dyn Expert>>,
    ) -> Orchestrator {
        let memory = Arc::new(
            MemoryManager::new(Connection::open_in_memory().unwrap(), EpisodeConfig::default())
                .unwrap(),
        );
        let logger =
            Arc::new(ActionLogger::new(Connection::open_in_memory().unwrap()).unwrap());
        let dispatcher = Arc::new(Dispatcher::new(experts, logger, &ExpertsConfig::default()));
        let llm = Arc::new(EngineRouter::new(
            vec![engine],
            "test-model".to_string(),
            Vec::new(),
        ));
        let satisfaction = Arc::new(
            SatisfactionTracker::new(Connection::open_in_memory().unwrap()).unwrap(),
        );
        Orchestrator::new(
            memory,
            dispatcher,
            llm,
            satisfaction,
            GenerationDefaults::default(),
        )
    }

    fn request(message: &str) -> TurnRequest {
        TurnRequest {
            message: message.to_string(),
            context_type: ContextType::Chat,
            model: None,
            client_signals: ClientSignals::default(),
        }
    }

    fn ctx() -> TurnContext {
        TurnContext::new(Session::local_dev_default(), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn empty_message_is_invalid() {
        let orch = orchestrator_with(Arc::new(EchoEngine), vec![]);
        let err = orch.run_turn(request("   "), &ctx()).await.unwrap_err();
        assert!(matches!(err, ErrorKind::Invalid(_)));
    }

    #[tokio::test]
    async fn oversized_message_is_invalid() {
        let orch = orchestrator_with(Arc::new(EchoEngine), vec![]);
        let big = "x".repeat(MAX_QUERY_BYTES + 1);
        let err = orch.run_turn(request(&big), &ctx()).await.unwrap_err();
        assert!(matches!(err, ErrorKind::Invalid(_)));
    }

    #[tokio::test]
    async fn conversational_turn_persists_exactly_one_interaction() {
        let orch = orchestrator_with(Arc::new(EchoEngine), vec![]);
        let ctx = ctx();
        let outcome = orch.run_turn(request("hello there"), &ctx).await.unwrap();

        assert!(outcome.response.starts_with("echo:"));
        assert!(outcome.executed_experts.is_empty());
        assert!(!outcome.partial);
        assert!(!outcome.interaction_id.is_empty());

        let interactions = orch
            .satisfaction
            .recent_interactions(&ctx.user_id, 10)
            .unwrap();
        assert_eq!(interactions.len(), 1);
        assert!(interactions[0].task_completed);
    }

    #[tokio::test]
    async fn turns_land_in_the_episode_newest_first() {
        let orch = orchestrator_with(Arc::new(EchoEngine), vec![]);
        let ctx = ctx();
        let first = orch.run_turn(request("first message"), &ctx).await.unwrap();
        let second = orch.run_turn(request("second message"), &ctx).await.unwrap();
        assert_eq!(first.episode_id, second.episode_id);

        let turns = orch.memory.recent_turns(&first.episode_id, 5).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].user_text, "second message");
    }

    #[tokio::test]
    async fn partial_dispatch_is_acknowledged_in_the_response() {
        let expert = Arc::new(StubExpert {
            score: 0.9,
            result: ActionResult::failed(
                ErrorKind::CircuitOpen {
                    service: "calendar".into(),
                },
                "Couldn't reach the calendar",
            ),
        });
        let orch = orchestrator_with(Arc::new(EchoEngine), vec![expert]);
        let ctx = ctx();
        let outcome = orch
            .run_turn(request("schedule a meeting"), &ctx)
            .await
            .unwrap();

        assert!(outcome.partial);
        assert!(outcome.response.starts_with("Heads up:"));
        assert!(outcome.executed_experts.is_empty());

        let interactions = orch
            .satisfaction
            .recent_interactions(&ctx.user_id, 10)
            .unwrap();
        assert_eq!(interactions.len(), 1);
        assert!(!interactions[0].task_completed);
    }

    #[tokio::test]
    async fn generation_failure_degrades_but_names_successes() {
        let expert = Arc::new(StubExpert {
            score: 0.9,
            result: ActionResult::ok("Added 'milk' to your shopping list").with_side_effects(),
        });
        let orch = orchestrator_with(Arc::new(DeadEngine), vec![expert]);
        let ctx = ctx();
        let outcome = orch
            .run_turn(request("add milk to my list"), &ctx)
            .await
            .unwrap();

        assert!(outcome.response.contains("Added 'milk' to your shopping list"));
        assert!(outcome
            .response
            .contains("couldn't form a full reply right now"));
        assert_eq!(outcome.executed_experts, vec!["list"]);

        // The turn still persisted, marked incomplete.
        let interactions = orch
            .satisfaction
            .recent_interactions(&ctx.user_id, 10)
            .unwrap();
        assert_eq!(interactions.len(), 1);
        assert!(!interactions[0].task_completed);
    }

    #[tokio::test]
    async fn streaming_turn_emits_tokens_then_end() {
        let orch = orchestrator_with(Arc::new(EchoEngine), vec![]);
        let ctx = ctx();
        let (tx, mut rx) = mpsc::channel(32);
        let outcome = orch
            .run_turn_stream(request("hello"), &ctx, tx)
            .await
            .unwrap();

        let mut saw_token = false;
        let mut saw_end = false;
        while let Some(event) = rx.recv().await {
            match event {
                ChatEvent::Token { .. } => saw_token = true,
                ChatEvent::End {
                    interaction_id,
                    episode_id,
                    ..
                } => {
                    saw_end = true;
                    assert_eq!(interaction_id, outcome.interaction_id);
                    assert_eq!(episode_id, outcome.episode_id);
                }
                ChatEvent::Error { .. } => panic!("unexpected error event"),
            }
        }
        assert!(saw_token && saw_end);
    }

    #[tokio::test]
    async fn streaming_failure_still_ends_and_persists() {
        let orch = orchestrator_with(Arc::new(DeadEngine), vec![]);
        let ctx = ctx();
        let (tx, mut rx) = mpsc::channel(32);
        let outcome = orch
            .run_turn_stream(request("hello"), &ctx, tx)
            .await
            .unwrap();

        let mut saw_error = false;
        let mut saw_end = false;
        while let Some(event) = rx.recv().await {
            match event {
                ChatEvent::Error { .. } => saw_error = true,
                ChatEvent::End { .. } => saw_end = true,
                ChatEvent::Token { .. } => {}
            }
        }
        assert!(saw_error && saw_end);
        assert!(!outcome.interaction_id.is_empty());
        let interactions = orch
            .satisfaction
            .recent_interactions(&ctx.user_id, 10)
            .unwrap();
        assert_eq!(interactions.len(), 1);
        assert!(!interactions[0].task_completed);
    }
}

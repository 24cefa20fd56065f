use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::engine::{EngineError, GenerationRequest, LlmEngine};
use crate::stream::TokenEvent;

/// Non-streaming completion deadline.
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(30);
/// The first streamed token must arrive within this window.
const FIRST_TOKEN_TIMEOUT: Duration = Duration::from_secs(15);
/// Maximum inter-token idle before the producer is cancelled.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long the primary engine is skipped after an OOM.
const OOM_COOLDOWN: Duration = Duration::from_secs(60);
/// Overall cap on the start-up warm-up pass.
const WARMUP_CAP: Duration = Duration::from_secs(30);

/// Routes generation requests across a priority-ordered engine chain.
///
/// On `Timeout` or OOM-like errors the router advances to the next engine;
/// `Cancelled` and `InvalidRequest` never trigger fallback. An OOM on the
/// primary puts it on a 60-second cool-down.
pub struct EngineRouter {
    slots: Vec<Arc<dyn LlmEngine>>,
    default_model: String,
    allowed_models: Vec<String>,
    primary_cooldown_until: Mutex<Option<Instant>>,
}

impl EngineRouter {
    /// At least one engine is required; slot 0 is the primary.
    pub fn new(
        slots: Vec<Arc<dyn LlmEngine>>,
        default_model: String,
        mut allowed_models: Vec<String>,
    ) -> Self {
        assert!(!slots.is_empty(), "EngineRouter requires at least one engine");
        if !allowed_models.contains(&default_model) {
            allowed_models.push(default_model.clone());
        }
        Self {
            slots,
            default_model,
            allowed_models,
            primary_cooldown_until: Mutex::new(None),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Resolve a requested model against the enumerated set.
    pub fn resolve_model(&self, requested: Option<&str>) -> Result<String, EngineError> {
        match requested {
            None => Ok(self.default_model.clone()),
            Some(m) if self.allowed_models.iter().any(|a| a == m) => Ok(m.to_string()),
            Some(m) => Err(EngineError::InvalidRequest(format!(
                "unknown model '{m}'"
            ))),
        }
    }

    fn primary_cooling(&self) -> bool {
        let guard = self.primary_cooldown_until.lock().unwrap();
        guard.map(|until| Instant::now() < until).unwrap_or(false)
    }

    fn note_failure(&self, slot: usize, err: &EngineError) {
        if slot == 0 && matches!(err, EngineError::Oom) {
            *self.primary_cooldown_until.lock().unwrap() = Some(Instant::now() + OOM_COOLDOWN);
            warn!("primary engine OOM: cooling down for {}s", OOM_COOLDOWN.as_secs());
        }
    }

    /// Engines eligible for this request, in priority order.
    fn chain(&self) -> Vec<(usize, &Arc<dyn LlmEngine>)> {
        let skip_primary = self.slots.len() > 1 && self.primary_cooling();
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, _)| !(skip_primary && *i == 0))
            .collect()
    }

    /// Non-streaming completion with the 30-second deadline per engine.
    pub async fn complete(&self, req: GenerationRequest) -> Result<String, EngineError> {
        let req = req.sanitized();
        let mut last_err = EngineError::Unavailable("no engine attempted".to_string());

        for (idx, engine) in self.chain() {
            match timeout(COMPLETE_TIMEOUT, engine.complete(&req)).await {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(e)) => {
                    warn!(engine = engine.name(), err = %e, "completion failed");
                    self.note_failure(idx, &e);
                    if !e.triggers_fallback() {
                        return Err(e);
                    }
                    last_err = e;
                }
                Err(_) => {
                    warn!(engine = engine.name(), "completion deadline exceeded");
                    last_err = EngineError::Timeout;
                }
            }
            info!(engine = engine.name(), "advancing to next engine");
        }
        Err(last_err)
    }

    /// Streaming completion. The stream is finite and not restartable: the
    /// router falls back to the next engine only while no token has been
    /// forwarded yet. Once tokens have flowed, a stall past the idle window
    /// cancels the producer and surfaces an error event.
    pub async fn stream(
        &self,
        req: GenerationRequest,
        tx: mpsc::Sender<TokenEvent>,
    ) -> Result<(), EngineError> {
        let req = req.sanitized();
        let mut last_err = EngineError::Unavailable("no engine attempted".to_string());

        for (idx, engine) in self.chain() {
            let (inner_tx, mut inner_rx) = mpsc::channel::<TokenEvent>(32);
            let engine_clone = Arc::clone(engine);
            let req_clone = req.clone();
            let producer = tokio::spawn(async move {
                engine_clone.stream(&req_clone, inner_tx).await
            });

            let mut emitted = false;
            let err: EngineError = loop {
                let window = if emitted { IDLE_TIMEOUT } else { FIRST_TOKEN_TIMEOUT };
                match timeout(window, inner_rx.recv()).await {
                    Ok(Some(TokenEvent::Token { text })) => {
                        emitted = true;
                        if tx.send(TokenEvent::Token { text }).await.is_err() {
                            // Consumer went away: treat as cancellation.
                            producer.abort();
                            return Err(EngineError::Cancelled);
                        }
                    }
                    Ok(Some(TokenEvent::Done)) => {
                        let _ = tx.send(TokenEvent::Done).await;
                        return Ok(());
                    }
                    Ok(Some(TokenEvent::Error { message })) => {
                        break EngineError::Unavailable(message);
                    }
                    Ok(None) => {
                        // Producer finished without Done: surface its error.
                        match producer.await {
                            Ok(Ok(())) => {
                                let _ = tx.send(TokenEvent::Done).await;
                                return Ok(());
                            }
                            Ok(Err(e)) => break e,
                            Err(_) => {
                                break EngineError::Unavailable(
                                    "stream producer panicked".into(),
                                )
                            }
                        }
                    }
                    Err(_) => {
                        producer.abort();
                        break EngineError::Timeout;
                    }
                }
            };

            warn!(engine = engine.name(), err = %err, "stream failed");
            self.note_failure(idx, &err);

            if emitted || !err.triggers_fallback() {
                let _ = tx
                    .send(TokenEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
            last_err = err;
            info!(engine = engine.name(), "advancing to next stream engine");
        }

        let _ = tx
            .send(TokenEvent::Error {
                message: last_err.to_string(),
            })
            .await;
        Err(last_err)
    }

    /// Issue one short completion against every engine to pre-compile
    /// kernels. Returns true when every engine was exercised within the cap;
    /// readiness should be signalled either way once this returns.
    pub async fn warm_up(&self) -> bool {
        let req = GenerationRequest {
            model: self.default_model.clone(),
            system_prompt: String::new(),
            prompt: "Hello".to_string(),
            max_tokens: 8,
            temperature: 0.0,
            stop: Vec::new(),
        };

        let pass = async {
            for engine in &self.slots {
                match engine.complete(&req).await {
                    Ok(_) => info!(engine = engine.name(), "warm-up ok"),
                    Err(e) => warn!(engine = engine.name(), err = %e, "warm-up failed"),
                }
            }
        };

        timeout(WARMUP_CAP, pass).await.is_ok()
    }
}

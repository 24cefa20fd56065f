use async_trait::async_trait;
use tokio::sync::mpsc;

use maia_core::error::ErrorKind;

use crate::stream::TokenEvent;

/// Hard cap on `max_tokens` regardless of what the caller asks for.
pub const MAX_TOKENS_CAP: u32 = 4096;

/// A fully resolved generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    /// Composed by the orchestrator; never truncated.
    pub system_prompt: String,
    /// The remaining prompt sections plus the user's message.
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
}

impl GenerationRequest {
    /// Clamp parameters into their documented ranges.
    pub fn sanitized(mut self) -> Self {
        self.max_tokens = self.max_tokens.min(MAX_TOKENS_CAP).max(1);
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("generation timed out")]
    Timeout,

    #[error("engine out of memory")]
    Oom,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Whether the fallback chain should advance past the failing engine.
    /// Client mistakes and cancellation must not burn through fallbacks.
    pub fn triggers_fallback(&self) -> bool {
        !matches!(self, EngineError::InvalidRequest(_) | EngineError::Cancelled)
    }
}

impl From<EngineError> for ErrorKind {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Timeout => ErrorKind::Timeout { ms: 30_000 },
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::InvalidRequest(msg) => ErrorKind::Invalid(msg),
            other => ErrorKind::Unavailable(other.to_string()),
        }
    }
}

/// Common interface for backend inference engines.
#[async_trait]
pub trait LlmEngine: Send + Sync {
    /// Engine name for logging and health reporting.
    fn name(&self) -> &str;

    /// Non-streaming completion: wait for the full response text.
    async fn complete(&self, req: &GenerationRequest) -> Result<String, EngineError>;

    /// Stream response tokens through a channel, finishing with `Done`.
    /// Default: falls back to non-streaming, emits one Token then Done.
    async fn stream(
        &self,
        req: &GenerationRequest,
        tx: mpsc::Sender<TokenEvent>,
    ) -> Result<(), EngineError> {
        let text = self.complete(req).await?;
        let _ = tx.send(TokenEvent::Token { text }).await;
        let _ = tx.send(TokenEvent::Done).await;
        Ok(())
    }
}

//! Chat endpoints: POST /api/chat (non-streaming), POST /api/chat/stream
//! (SSE), GET /api/chat/status.

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;

use maia_core::error::ErrorKind;
use maia_core::types::{ContextType, TurnContext};
use maia_orchestrator::{ChatEvent, ClientSignals, TurnRequest};

use crate::app::AppState;
use crate::http::error::ApiError;

/// Whole-turn wall-clock budget, slightly above dispatch + generate ceilings.
const TURN_BUDGET: Duration = Duration::from_secs(45);

#[derive(Deserialize)]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub context_type: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub client_signals: Option<ClientSignals>,
}

#[derive(Serialize)]
pub struct ChatReply {
    pub response: String,
    pub response_time: f64,
    pub interaction_id: String,
    pub episode_id: String,
    pub executed_experts: Vec<String>,
    pub partial: bool,
}

fn turn_request(body: ChatBody) -> Result<TurnRequest, ApiError> {
    let context_type = match body.context_type.as_deref() {
        None => ContextType::Chat,
        Some(raw) => ContextType::from_str(raw)
            .map_err(|e| ApiError::from(ErrorKind::Invalid(e)))?,
    };
    Ok(TurnRequest {
        message: body.message,
        context_type,
        model: body.model,
        client_signals: body.client_signals.unwrap_or_default(),
    })
}

/// POST /api/chat: run a full turn and return the response in one piece.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Json<ChatReply>, ApiError> {
    let session = crate::http::authenticate(&state, &headers).await?;
    let req = turn_request(body)?;
    let ctx = TurnContext::new(session, TURN_BUDGET);

    let outcome = state
        .orchestrator
        .run_turn(req, &ctx)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(ChatReply {
        response: outcome.response,
        response_time: outcome.response_time_ms as f64 / 1000.0,
        interaction_id: outcome.interaction_id,
        episode_id: outcome.episode_id,
        executed_experts: outcome.executed_experts,
        partial: outcome.partial,
    }))
}

/// POST /api/chat/stream: SSE. Data lines carry `token` events followed by
/// a final `end` event; the `end` event fires even after an error.
pub async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = crate::http::authenticate(&state, &headers).await?;
    let req = turn_request(body)?;
    let ctx = TurnContext::new(session, TURN_BUDGET);

    let (tx, rx) = tokio::sync::mpsc::channel::<ChatEvent>(64);
    tokio::spawn(async move {
        if let Err(e) = state.orchestrator.run_turn_stream(req, &ctx, tx.clone()).await {
            // Pre-compose failures never produced an End event; emit the
            // error and a terminal end so the contract holds for clients.
            warn!(err = %e, "stream turn failed before composing");
            let _ = tx.send(ChatEvent::Error { kind: e }).await;
            let _ = tx
                .send(ChatEvent::End {
                    interaction_id: String::new(),
                    episode_id: String::new(),
                    executed_experts: Vec::new(),
                    partial: false,
                })
                .await;
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let payload = serde_json::to_string(&event)
            .unwrap_or_else(|_| "{\"type\":\"error\",\"kind\":\"internal\"}".to_string());
        Ok(Event::default().data(payload))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub context_type: Option<String>,
}

/// GET /api/chat/status: the caller's active episode, if any. Admins may
/// inspect another user via `?user_id=`.
pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = crate::http::authenticate(&state, &headers).await?;

    let user_id = match query.user_id {
        Some(other) if other != session.user_id => {
            maia_auth::SessionShim::require_admin(&session).map_err(ApiError::from)?;
            other
        }
        Some(own) => own,
        None => session.user_id.clone(),
    };

    let context_type = match query.context_type.as_deref() {
        None => ContextType::Chat,
        Some(raw) => ContextType::from_str(raw)
            .map_err(|e| ApiError::from(ErrorKind::Invalid(e)))?,
    };

    let episode = state
        .memory
        .active_episode(&user_id, context_type)
        .map_err(|e| ApiError::from(ErrorKind::from(e)))?;

    Ok(Json(match episode {
        Some(ep) => json!({
            "active_episode": ep.id,
            "episode_messages": ep.message_count,
            "enhancements": {
                "context_type": ep.context_type,
                "started_at": ep.started_at,
                "last_activity_at": ep.last_activity_at,
                "summary": ep.summary,
            },
        }),
        None => json!({
            "active_episode": null,
            "episode_messages": 0,
            "enhancements": {},
        }),
    }))
}

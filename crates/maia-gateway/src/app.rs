use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use maia_auth::SessionShim;
use maia_core::config::MaiaConfig;
use maia_experts::ActionLogger;
use maia_memory::MemoryManager;
use maia_orchestrator::Orchestrator;
use maia_outbound::OutboundClient;
use maia_satisfaction::SatisfactionTracker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state behind every handler, cheap to clone as an `Arc`.
pub struct AppState {
    pub config: MaiaConfig,
    pub shim: SessionShim,
    pub orchestrator: Orchestrator,
    pub memory: Arc<MemoryManager>,
    pub satisfaction: Arc<SatisfactionTracker>,
    pub action_log: Arc<ActionLogger>,
    pub outbound: Arc<OutboundClient>,
    /// Flips once LLM warm-up completes (or its cap elapses).
    pub ready: AtomicBool,
}

/// Wire every route to its handler.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(crate::http::chat::chat_handler))
        .route(
            "/api/chat/stream",
            post(crate::http::chat::chat_stream_handler),
        )
        .route("/api/chat/status", get(crate::http::chat::status_handler))
        .route(
            "/api/feedback/{interaction_id}",
            post(crate::http::feedback::feedback_handler),
        )
        .route("/api/experts", get(crate::http::experts::list_handler))
        .route(
            "/api/experts/{name}/probe",
            post(crate::http::experts::probe_handler),
        )
        .route("/api/health", get(crate::http::health::health_handler))
        .route(
            "/api/satisfaction",
            get(crate::http::insights::satisfaction_handler),
        )
        .route("/api/actions", get(crate::http::insights::actions_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

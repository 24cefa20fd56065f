use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /api/health: liveness plus readiness (warm-up) and breaker state.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::app::VERSION,
        "ready": state.ready.load(Ordering::Relaxed),
        "open_circuits": state.outbound.breaker().open_circuits(),
        "action_log_dropped": state.action_log.dropped_count(),
    }))
}

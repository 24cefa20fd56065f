//! Read-side insights: GET /api/satisfaction (own aggregates) and
//! GET /api/actions (recent action log, admin audit).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use maia_auth::SessionShim;
use maia_core::error::ErrorKind;

use crate::app::AppState;
use crate::http::error::ApiError;

/// GET /api/satisfaction: lazy aggregates for the calling user.
pub async fn satisfaction_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let session = crate::http::authenticate(&state, &headers).await?;
    let stats = state
        .satisfaction
        .stats(&session.user_id)
        .map_err(|e| ApiError::from(ErrorKind::from(e)))?;
    Ok(Json(json!(stats)))
}

#[derive(Deserialize)]
pub struct ActionsQuery {
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/actions?since=...: recent expert executions. Admins may audit
/// another user via `?user_id=`.
pub async fn actions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ActionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let session = crate::http::authenticate(&state, &headers).await?;

    let user_id = match query.user_id {
        Some(other) if other != session.user_id => {
            SessionShim::require_admin(&session).map_err(ApiError::from)?;
            other
        }
        Some(own) => own,
        None => session.user_id.clone(),
    };

    let limit = query.limit.unwrap_or(100).min(1000);
    let entries = state
        .action_log
        .recent(&user_id, query.since.as_deref(), limit)
        .map_err(|e| ApiError::from(ErrorKind::Internal(e.to_string())))?;

    let rows: Vec<Value> = entries
        .into_iter()
        .map(|e| {
            json!({
                "id": e.id,
                "tool_name": e.tool_name,
                "tool_params": e.tool_params,
                "success": e.success,
                "timestamp": e.timestamp,
                "context": e.context,
                "session_id": e.session_id,
            })
        })
        .collect();

    Ok(Json(json!({ "actions": rows })))
}

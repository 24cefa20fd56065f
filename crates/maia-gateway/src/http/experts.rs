//! Expert admin surface: GET /api/experts, POST /api/experts/{name}/probe.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use maia_auth::SessionShim;
use maia_core::error::ErrorKind;

use crate::app::AppState;
use crate::http::error::ApiError;

/// GET /api/experts: static descriptors (admin).
pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let session = crate::http::authenticate(&state, &headers).await?;
    SessionShim::require_admin(&session).map_err(ApiError::from)?;

    let descriptors = state.orchestrator.dispatcher().descriptors();
    Ok(Json(json!({ "experts": descriptors })))
}

#[derive(Deserialize)]
pub struct ProbeBody {
    pub query: String,
}

/// POST /api/experts/{name}/probe: score a query without executing (debug).
pub async fn probe_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(body): Json<ProbeBody>,
) -> Result<Json<Value>, ApiError> {
    let session = crate::http::authenticate(&state, &headers).await?;
    SessionShim::require_admin(&session).map_err(ApiError::from)?;

    match state.orchestrator.dispatcher().probe(&name, &body.query) {
        Some(score) => Ok(Json(json!({ "name": name, "score": score }))),
        None => Err(ApiError::from(ErrorKind::NotFound(format!(
            "expert '{name}'"
        )))),
    }
}

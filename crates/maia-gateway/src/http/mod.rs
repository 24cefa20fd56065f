pub mod chat;
pub mod error;
pub mod experts;
pub mod feedback;
pub mod health;
pub mod insights;

use axum::http::HeaderMap;
use std::sync::Arc;

use maia_core::types::Session;

use crate::app::AppState;
use error::ApiError;

/// Resolve the caller's session from `X-Session-ID`.
pub(crate) async fn authenticate(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<Session, ApiError> {
    let token = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok());
    state
        .shim
        .validate(token)
        .await
        .map_err(ApiError::from)
}

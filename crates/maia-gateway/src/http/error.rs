use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use maia_core::error::ErrorKind;

/// Standard error envelope for every non-`/chat` endpoint:
/// `{ error, message, status_code, timestamp, request_id }`.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub request_id: String,
}

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(request_id = %self.request_id, err = %self.kind, "request failed");
        }
        let body = json!({
            "error": self.kind.code(),
            "message": self.kind.to_string(),
            "status_code": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "request_id": self.request_id,
        });
        (status, Json(body)).into_response()
    }
}

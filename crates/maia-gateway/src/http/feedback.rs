//! POST /api/feedback/{interaction_id}: explicit user feedback.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use maia_core::error::ErrorKind;
use maia_satisfaction::FeedbackKind;

use crate::app::AppState;
use crate::http::error::ApiError;

#[derive(Deserialize)]
pub struct FeedbackBody {
    pub kind: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub text: Option<String>,
}

pub async fn feedback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(interaction_id): Path<String>,
    Json(body): Json<FeedbackBody>,
) -> Result<Json<Value>, ApiError> {
    let session = crate::http::authenticate(&state, &headers).await?;

    let kind = FeedbackKind::from_str(&body.kind)
        .map_err(|e| ApiError::from(ErrorKind::Invalid(e)))?;

    // Ratings arrive as integers, thumbs as booleans.
    let value = match (&kind, &body.value) {
        (FeedbackKind::Rating, Some(Value::Number(n))) => {
            let rating = n.as_f64().unwrap_or(0.0);
            if !(1.0..=5.0).contains(&rating) {
                return Err(ApiError::from(ErrorKind::Invalid(
                    "rating must be between 1 and 5".to_string(),
                )));
            }
            Some(rating)
        }
        (FeedbackKind::Rating, _) => {
            return Err(ApiError::from(ErrorKind::Invalid(
                "rating feedback requires an integer value".to_string(),
            )))
        }
        (FeedbackKind::Thumbs, Some(Value::Bool(up))) => Some(if *up { 1.0 } else { 0.0 }),
        (FeedbackKind::Thumbs, _) => {
            return Err(ApiError::from(ErrorKind::Invalid(
                "thumbs feedback requires a boolean value".to_string(),
            )))
        }
        (FeedbackKind::Text, _) => None,
        (FeedbackKind::Implicit, _) => {
            return Err(ApiError::from(ErrorKind::Invalid(
                "implicit feedback is recorded by the server, not posted".to_string(),
            )))
        }
    };

    if kind == FeedbackKind::Text && body.text.as_deref().unwrap_or("").is_empty() {
        return Err(ApiError::from(ErrorKind::Invalid(
            "text feedback requires a text body".to_string(),
        )));
    }

    let feedback = state
        .satisfaction
        .record_feedback(
            &session.user_id,
            &interaction_id,
            kind,
            value,
            body.text.as_deref(),
        )
        .map_err(|e| ApiError::from(ErrorKind::from(e)))?;

    Ok(Json(json!({
        "feedback_id": feedback.id,
        "interaction_id": feedback.interaction_id,
        "kind": feedback.kind,
        "created_at": feedback.created_at,
    })))
}

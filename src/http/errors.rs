use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::errors::{HttpError, WebhookError};

#[derive(Debug, thiserror::Error)]
pub(super) enum WebError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        match self {
            WebError::Http(err) => match err {
                HttpError::RateLimited => {
                    error_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded")
                }
                HttpError::InvalidSignature => {
                    error_response(StatusCode::UNAUTHORIZED, "Invalid signature")
                }
                HttpError::MissingHeader { header } => error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("Missing {} header", header),
                ),
                HttpError::Unhandled { details } => {
                    tracing::error!(details = ?details, "Unhandled error");
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                }
            },
            WebError::Webhook(err) => {
                tracing::error!(error = ?err, category = %err.category(), "Webhook processing failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to process event")
            }
        }
    }
}

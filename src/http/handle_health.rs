use axum::{Json, response::IntoResponse};
use serde_json::json;

/// GET /health
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "mode": "bot",
    }))
}

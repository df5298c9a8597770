use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
};
use serde_json::json;
use tracing::{info, warn};

use super::errors::WebError;
use crate::{bot::Event, bot::verify_signature, errors::HttpError, http::WebContext};

pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// POST /webhook
///
/// Checks, in order: rate limit, signature (when a secret is configured),
/// then the event header. Accepted events are routed before responding.
pub(super) async fn handle_webhook(
    State(context): State<WebContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, WebError> {
    if !context.rate_limiter.allow() {
        return Err(HttpError::RateLimited.into());
    }

    let delivery_id = header(&headers, DELIVERY_HEADER).unwrap_or_default();

    if let Some(secret) = &context.webhook_secret
        && let Err(e) = verify_signature(secret.as_ref(), &body, header(&headers, SIGNATURE_HEADER))
    {
        warn!(delivery_id, "Rejected webhook with invalid signature");
        return Err(e.into());
    }

    let event_type = header(&headers, EVENT_HEADER)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| HttpError::MissingHeader {
            header: EVENT_HEADER.to_string(),
        })?;

    info!(
        event_type,
        delivery_id,
        body_len = body.len(),
        "Received webhook"
    );

    let event = Event::new(event_type, delivery_id, &body);
    context.router.route(&event, &context.cancel_token).await?;

    Ok(Json(json!({
        "status": "accepted",
        "event": event_type,
    })))
}

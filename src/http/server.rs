use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::http::{context::WebContext, handle_health::handle_health, handle_webhook::handle_webhook};

pub fn build_router(web_context: WebContext) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &http::Request<_>| {
            let delivery_id = request
                .headers()
                .get("x-github-delivery")
                .and_then(|h| h.to_str().ok())
                .map(String::from)
                .unwrap_or_default();

            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                delivery_id = %delivery_id,
                request_id = %uuid::Uuid::new_v4(),
            )
        })
        .on_request(|request: &http::Request<_>, _span: &Span| {
            tracing::debug!(
                "started processing request {} {}",
                request.method(),
                request.uri().path()
            );
        })
        .on_response(
            |response: &http::Response<_>, latency: Duration, _span: &Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis(),
                    "finished processing request"
                );
            },
        )
        .on_failure(
            |err: ServerErrorsFailureClass, latency: Duration, _span: &Span| {
                tracing::error!(
                    error = ?err,
                    latency_ms = latency.as_millis(),
                    "request failed"
                );
            },
        );

    let timeout = web_context.request_timeout;

    Router::new()
        .route("/health", get(handle_health))
        .route("/webhook", post(handle_webhook))
        .layer((trace_layer, TimeoutLayer::new(timeout)))
        .with_state(web_context)
}

use std::{ops::Deref, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    bot::{EventRouter, RateLimiter},
    config::WebhookSecret,
};

pub struct InnerWebContext {
    pub(crate) router: Arc<EventRouter>,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) webhook_secret: Option<WebhookSecret>,
    pub(crate) request_timeout: Duration,
    /// Cancelled at shutdown; handed to event handlers for their model calls.
    pub(crate) cancel_token: CancellationToken,
}

#[derive(Clone)]
pub struct WebContext(pub(crate) Arc<InnerWebContext>);

impl Deref for WebContext {
    type Target = InnerWebContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl WebContext {
    pub fn new(
        router: Arc<EventRouter>,
        rate_limiter: Arc<RateLimiter>,
        webhook_secret: Option<WebhookSecret>,
        request_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self(Arc::new(InnerWebContext {
            router,
            rate_limiter,
            webhook_secret,
            request_timeout,
            cancel_token,
        }))
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.0.router
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.0.rate_limiter
    }
}

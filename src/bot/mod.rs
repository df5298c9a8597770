//! GitHub webhook bot.
//!
//! [`BotService`] wires the pieces of bot mode together: an [`EventRouter`]
//! with the bot-sender filter and one handler per supported event, a
//! [`RateLimiter`] guarding the intake, and the axum server from
//! [`crate::http`]. Requests flow through the layers in this order:
//!
//! ```text
//! POST /webhook ─► rate limit ─► signature ─► X-GitHub-Event ─► router ─► handler
//!                     429          401             400             200      500
//! ```

pub mod handlers;
pub mod ratelimit;
pub mod router;
pub mod signature;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::BotConfig;
use crate::errors::ConfigError;
use crate::http::{WebContext, build_router};
use crate::models::{ModelExecutor, SUPPORTED_MODELS};
use crate::processor::{ProcessorRegistry, parse_processor_identifier};

pub use handlers::{
    HandlerContext, IssuesHandler, PullRequestHandler, PushHandler, ReleaseHandler,
};
pub use ratelimit::RateLimiter;
pub use router::{Event, EventFilter, EventHandler, EventRouter, bot_event_filter, default_filters};
pub use signature::verify_signature;

pub struct BotService {
    config: BotConfig,
    router: Arc<EventRouter>,
    rate_limiter: Arc<RateLimiter>,
}

impl BotService {
    /// Fails when the default model or processor is not one cronai knows.
    pub fn new(
        config: BotConfig,
        models: Arc<ModelExecutor>,
        processors: Arc<ProcessorRegistry>,
    ) -> Result<Self, ConfigError> {
        if !SUPPORTED_MODELS.contains(&config.default_model.as_str()) {
            return Err(ConfigError::InvalidValue {
                name: "CRONAI_DEFAULT_MODEL".to_string(),
                details: format!(
                    "unsupported model '{}' (supported: {})",
                    config.default_model,
                    SUPPORTED_MODELS.join(", ")
                ),
            });
        }
        parse_processor_identifier(&config.default_processor).map_err(|e| {
            ConfigError::InvalidValue {
                name: "CRONAI_BOT_PROCESSOR".to_string(),
                details: e.to_string(),
            }
        })?;

        let router = Arc::new(EventRouter::new());
        for filter in default_filters() {
            router.add_filter(filter);
        }

        let context = HandlerContext {
            models,
            processors,
            model: config.default_model.clone(),
            processor: config.default_processor.clone(),
            prompt_override: None,
        };
        router.register_handler("issues", Arc::new(IssuesHandler::new(context.clone())));
        router.register_handler(
            "pull_request",
            Arc::new(PullRequestHandler::new(context.clone())),
        );
        router.register_handler("push", Arc::new(PushHandler::new(context.clone())));
        router.register_handler("release", Arc::new(ReleaseHandler::new(context)));

        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_tokens,
            config.rate_limit_refill,
        ));

        Ok(Self {
            config,
            router,
            rate_limiter,
        })
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn web_context(&self, cancel_token: CancellationToken) -> WebContext {
        WebContext::new(
            self.router.clone(),
            self.rate_limiter.clone(),
            self.config.webhook_secret.clone(),
            self.config.request_timeout,
            cancel_token,
        )
    }

    /// Binds the configured port and serves until `cancel_token` fires.
    pub async fn run(&self, cancel_token: CancellationToken) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], *self.config.port.as_ref()));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding webhook server to {}", addr))?;
        self.serve(listener, cancel_token).await
    }

    /// Serves on an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel_token: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(
            address = %listener.local_addr()?,
            handlers = ?self.router.registered_types(),
            signature_required = self.config.webhook_secret.is_some(),
            model = %self.config.default_model,
            processor = %self.config.default_processor,
            "Starting bot mode service"
        );

        let app = build_router(self.web_context(cancel_token.clone()));
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel_token.cancelled().await })
            .await
            .context("webhook server failed")?;

        info!("Bot mode service stopped");
        Ok(())
    }
}

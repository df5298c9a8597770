//! # cronai
//!
//! cronai runs AI prompts against OpenAI, Claude or Gemini and hands the
//! responses to output processors (console, file, Slack, email, webhooks,
//! GitHub). Work arrives through three triggers:
//!
//! - **cron**: config file lines pair a five-field schedule with a model,
//!   prompt and processor ([`tasks::CronScheduler`]).
//! - **queue**: JSON task messages from an in-memory channel, RabbitMQ or
//!   Redis ([`queue::QueueService`]).
//! - **bot**: signed GitHub webhooks routed to per-event handlers
//!   ([`bot::BotService`]).
//!
//! All three feed the same pipeline: load the prompt, execute the model with
//! its fallback chain, then render and deliver through the processor.
//!
//! ## Error Handling
//!
//! All error strings use the format: `error-cronai-<domain>-<number> <message>: <details>`
//! and every error maps to an [`errors::ErrorCategory`] that decides whether a
//! failed task is retried.

/// GitHub webhook intake: rate limiting, signatures, routing and handlers.
pub mod bot;

/// Environment-driven configuration and its validated newtypes.
pub mod config;

pub mod errors;

/// HTTP surface of bot mode.
pub mod http;

/// Model backends and the fallback executor.
pub mod models;

/// Output processors and their registry.
pub mod processor;

/// Prompt files, front matter and variable substitution.
pub mod prompt;

/// Queue consumers, the coordinator and the shared task pipeline.
pub mod queue;

pub mod services;

/// Cron scheduling and background task supervision.
pub mod tasks;

/// Go-style text templates used to render processor payloads.
pub mod template;

pub use services::Services;

#[cfg(test)]
pub mod test_helpers;

//! HTTP surface of bot mode.
//!
//! - `GET /health` reports liveness as `{"status":"healthy","mode":"bot"}`.
//! - `POST /webhook` accepts GitHub deliveries and hands them to the
//!   [`EventRouter`](crate::bot::EventRouter).
//!
//! Other methods on either path get 405 from the router.

/// Shared request state.
pub mod context;

pub(crate) mod errors;
pub(crate) mod handle_health;
pub(crate) mod handle_webhook;

/// Router construction.
pub mod server;

pub use context::*;
pub use server::*;

//! Dispatch of GitHub webhook events to per-type handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::WebhookError;

/// One inbound webhook delivery.
#[derive(Clone, Debug, Default)]
pub struct Event {
    /// Value of the `X-GitHub-Event` header.
    pub event_type: String,
    /// Top-level `action` of the payload, empty when absent.
    pub action: String,
    /// Value of the `X-GitHub-Delivery` header, empty when absent.
    pub delivery_id: String,
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(event_type: &str, delivery_id: &str, payload: &[u8]) -> Self {
        Self {
            event_type: event_type.to_string(),
            action: extract_action(payload),
            delivery_id: delivery_id.to_string(),
            payload: payload.to_vec(),
        }
    }
}

#[derive(Deserialize)]
struct ActionProbe {
    #[serde(default)]
    action: String,
}

fn extract_action(payload: &[u8]) -> String {
    serde_json::from_slice::<ActionProbe>(payload)
        .map(|probe| probe.action)
        .unwrap_or_default()
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        event: &Event,
        cancel_token: &CancellationToken,
    ) -> Result<(), WebhookError>;
}

/// Returns false to drop an event before dispatch.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Drops events sent by GitHub Apps and other bot accounts. Payloads that
/// do not parse pass through.
pub fn bot_event_filter() -> EventFilter {
    #[derive(Deserialize, Default)]
    struct Sender {
        #[serde(default, rename = "type")]
        sender_type: String,
    }

    #[derive(Deserialize)]
    struct SenderProbe {
        #[serde(default)]
        sender: Sender,
    }

    Arc::new(|event: &Event| {
        serde_json::from_slice::<SenderProbe>(&event.payload)
            .map(|probe| probe.sender.sender_type != "Bot")
            .unwrap_or(true)
    })
}

pub fn default_filters() -> Vec<EventFilter> {
    vec![bot_event_filter()]
}

#[derive(Default)]
pub struct EventRouter {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
    filters: RwLock<Vec<EventFilter>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.handlers.write().insert(event_type.to_string(), handler);
        debug!(event_type, "Registered handler for event type");
    }

    pub fn add_filter(&self, filter: EventFilter) {
        self.filters.write().push(filter);
    }

    /// Event types with a handler, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Filtered events and events without a handler are accepted without
    /// running anything.
    pub async fn route(
        &self,
        event: &Event,
        cancel_token: &CancellationToken,
    ) -> Result<(), WebhookError> {
        let filters = self.filters.read().clone();
        if filters.iter().any(|filter| !filter(event)) {
            debug!(
                event_type = %event.event_type,
                action = %event.action,
                delivery_id = %event.delivery_id,
                "Event filtered out"
            );
            return Ok(());
        }

        let handler = self.handlers.read().get(&event.event_type).cloned();
        let Some(handler) = handler else {
            warn!(
                event_type = %event.event_type,
                delivery_id = %event.delivery_id,
                "No handler registered for event type"
            );
            return Ok(());
        };

        info!(
            event_type = %event.event_type,
            action = %event.action,
            delivery_id = %event.delivery_id,
            "Routing event to handler"
        );
        handler.handle(event, cancel_token).await
    }
}

//! Queue intake: consumers, message parsing, retry policies and the
//! coordinator that supervises them.
//!
//! A [`Consumer`] owns its transport connection and the channels it hands
//! out from [`Consumer::consume`]. The [`Coordinator`] runs one loop per
//! consumer, turns every delivery into a [`TaskMessage`] and settles it with
//! exactly one acknowledge or reject.
//!
//! ```text
//! transport -> Consumer -> Deliveries { messages, errors }
//!                               |
//!                          Coordinator -> parse -> validate -> TaskProcessor
//!                               |
//!                   acknowledge | reject(requeue) per RetryPolicy
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::QueueError;

pub mod config;
pub mod consumers;
pub mod coordinator;
pub mod parser;
pub mod registry;
pub mod retry;
pub mod service;
pub mod task_processor;

pub use config::parse_queue_line;
pub use consumers::{AmqpConsumer, MemoryConsumer, RedisConsumer};
pub use coordinator::{Coordinator, CoordinatorStats, TaskProcessor};
pub use parser::{JsonMessageParser, MessageParser};
pub use registry::{ConsumerFactory, ConsumerRegistry};
pub use retry::{ExponentialBackoff, LinearRetry, NoRetry, RetryPolicy};
pub use service::QueueService;
pub use task_processor::PipelineTaskProcessor;

/// Capacity of the channels consumers hand to the coordinator.
pub const DELIVERY_BUFFER: usize = 100;

/// Attribute carrying the delay the coordinator asks a consumer to wait
/// before a requeued message becomes visible again.
pub const RETRY_DELAY_ATTRIBUTE: &str = "_retry_delay_ms";

/// A raw delivery from a queue transport.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: String,
    pub body: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
    pub retry_count: u32,
    pub queue_source: String,
}

impl Message {
    pub fn new(id: impl Into<String>, body: impl Into<Vec<u8>>, queue_source: &str) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            attributes: HashMap::new(),
            received_at: Utc::now(),
            retry_count: 0,
            queue_source: queue_source.to_string(),
        }
    }

    /// The requeue delay requested by the coordinator, if any.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.attributes
            .get(RETRY_DELAY_ATTRIBUTE)
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_millis)
    }
}

/// The canonical task parsed out of a queue message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub model: String,
    pub prompt: String,
    pub processor: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub is_inline: bool,
}

/// Settings shared by every consumer type.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerConfig {
    pub queue_type: String,
    pub connection: String,
    pub queue: String,
    pub options: HashMap<String, String>,
    pub retry_limit: u32,
    pub retry_delay: Duration,
}

impl ConsumerConfig {
    pub fn new(queue_type: &str, connection: &str, queue: &str) -> Self {
        Self {
            queue_type: queue_type.to_string(),
            connection: connection.to_string(),
            queue: queue.to_string(),
            options: HashMap::new(),
            retry_limit: config::DEFAULT_RETRY_LIMIT,
            retry_delay: config::DEFAULT_RETRY_DELAY,
        }
    }

    /// Consumer name used when none is given explicitly.
    pub fn default_name(&self) -> String {
        format!("{}-{}", self.queue_type, self.queue)
    }
}

/// Channels handed out by [`Consumer::consume`]. Both close when the
/// consumer disconnects or the consume token is cancelled.
pub struct Deliveries {
    pub messages: mpsc::Receiver<Message>,
    pub errors: mpsc::Receiver<QueueError>,
}

/// A queue client yielding messages to be processed.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn connect(&self) -> Result<(), QueueError>;

    async fn disconnect(&self) -> Result<(), QueueError>;

    /// Starts delivery. Channels stay open until `cancel_token` fires or
    /// the consumer disconnects.
    async fn consume(&self, cancel_token: CancellationToken) -> Result<Deliveries, QueueError>;

    async fn acknowledge(&self, message: &Message) -> Result<(), QueueError>;

    async fn reject(&self, message: &Message, requeue: bool) -> Result<(), QueueError>;

    fn name(&self) -> &str;

    fn validate(&self) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_attribute() {
        let mut message = Message::new("1", "{}", "memory");
        assert_eq!(message.retry_delay(), None);

        message
            .attributes
            .insert(RETRY_DELAY_ATTRIBUTE.to_string(), "1500".to_string());
        assert_eq!(message.retry_delay(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_default_consumer_name() {
        let config = ConsumerConfig::new("rabbitmq", "amqp://localhost", "jobs");
        assert_eq!(config.default_name(), "rabbitmq-jobs");
        assert_eq!(config.retry_limit, 3);
    }
}

//! RabbitMQ consumer built on `lapin`.
//!
//! The queue is declared durable and the channel prefetch is 1, so a worker
//! holds at most one unacknowledged delivery. Requeued messages are
//! republished with an `x-retry-count` header before the original delivery
//! is acknowledged; a plain broker requeue would lose the count.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::QueueError;
use crate::queue::{Consumer, ConsumerConfig, DELIVERY_BUFFER, Deliveries, Message};

pub const DELIVERY_TAG_ATTRIBUTE: &str = "_delivery_tag";
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

const PREFETCH_COUNT: u16 = 1;
const PERSISTENT_DELIVERY: u8 = 2;

fn amqp_failed(operation: &str) -> impl FnOnce(lapin::Error) -> QueueError {
    let operation = operation.to_string();
    move |source| QueueError::AmqpOperationFailed { operation, source }
}

fn header_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(text) => Some(String::from_utf8_lossy(text.as_bytes()).into_owned()),
        AMQPValue::ShortString(text) => Some(text.as_str().to_string()),
        _ => None,
    }
}

fn header_count(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        other => header_string(other).and_then(|text| text.parse().ok()),
    }
}

/// Builds a [`Message`] from a delivery. String headers become attributes.
fn message_from_delivery(
    queue: &str,
    delivery_tag: u64,
    data: Vec<u8>,
    properties: &BasicProperties,
) -> Message {
    let id = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_else(|| {
            format!(
                "amqp-{}",
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
            )
        });

    let mut message = Message::new(id, data, queue);
    if let Some(headers) = properties.headers() {
        for (key, value) in headers.inner() {
            if key.as_str() == RETRY_COUNT_HEADER {
                message.retry_count = header_count(value).unwrap_or(0);
            } else if let Some(text) = header_string(value) {
                message.attributes.insert(key.as_str().to_string(), text);
            }
        }
    }
    message
        .attributes
        .insert(DELIVERY_TAG_ATTRIBUTE.to_string(), delivery_tag.to_string());
    message
}

/// Properties for a republished copy of `message`.
fn retry_properties(message: &Message) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in &message.attributes {
        if key.starts_with('_') {
            continue;
        }
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(value.as_str().into()),
        );
    }
    headers.insert(
        ShortString::from(RETRY_COUNT_HEADER),
        AMQPValue::LongLongInt(i64::from(message.retry_count)),
    );
    BasicProperties::default()
        .with_message_id(ShortString::from(message.id.clone()))
        .with_delivery_mode(PERSISTENT_DELIVERY)
        .with_headers(headers)
}

#[derive(Default)]
struct AmqpState {
    connection: Option<Connection>,
    channel: Option<Channel>,
    pump_token: Option<CancellationToken>,
}

pub struct AmqpConsumer {
    name: String,
    config: ConsumerConfig,
    state: Mutex<AmqpState>,
}

impl AmqpConsumer {
    pub fn new(name: &str, config: ConsumerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: Mutex::new(AmqpState::default()),
        }
    }

    fn channel(&self) -> Result<Channel, QueueError> {
        self.state
            .lock()
            .channel
            .clone()
            .ok_or_else(|| QueueError::NotConnected {
                consumer: self.name.clone(),
            })
    }

    fn delivery_tag(message: &Message) -> Result<u64, QueueError> {
        message
            .attributes
            .get(DELIVERY_TAG_ATTRIBUTE)
            .and_then(|tag| tag.parse().ok())
            .ok_or_else(|| QueueError::InvalidConfig {
                details: format!("message {} has no delivery tag", message.id),
            })
    }
}

async fn pump(
    queue: String,
    mut deliveries: lapin::Consumer,
    messages: mpsc::Sender<Message>,
    errors: mpsc::Sender<QueueError>,
    cancel_token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = cancel_token.cancelled() => break,
            next = deliveries.next() => next,
        };
        match next {
            Some(Ok(delivery)) => {
                let message = message_from_delivery(
                    &queue,
                    delivery.delivery_tag,
                    delivery.data,
                    &delivery.properties,
                );
                if messages.send(message).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                if errors.send(amqp_failed("consume")(e)).await.is_err() {
                    break;
                }
            }
            None => break,
        }
    }
    debug!(queue = %queue, "AMQP pump stopped");
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn connect(&self) -> Result<(), QueueError> {
        if self.state.lock().channel.is_some() {
            return Ok(());
        }

        let connection =
            Connection::connect(&self.config.connection, ConnectionProperties::default())
                .await
                .map_err(|e| QueueError::ConnectionFailed {
                    queue_type: "rabbitmq".to_string(),
                    details: e.to_string(),
                })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(amqp_failed("create channel"))?;
        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(amqp_failed("declare queue"))?;
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(amqp_failed("set qos"))?;

        info!(consumer = %self.name, queue = %self.config.queue, "Connected to RabbitMQ");
        let mut state = self.state.lock();
        state.connection = Some(connection);
        state.channel = Some(channel);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), QueueError> {
        let (connection, channel) = {
            let mut state = self.state.lock();
            if let Some(token) = state.pump_token.take() {
                token.cancel();
            }
            (state.connection.take(), state.channel.take())
        };

        if let Some(channel) = channel
            && let Err(e) = channel.close(200, "Bye").await
        {
            warn!(error = ?e, consumer = %self.name, "Failed to close AMQP channel");
        }
        if let Some(connection) = connection {
            connection
                .close(200, "Bye")
                .await
                .map_err(amqp_failed("close connection"))?;
            debug!(consumer = %self.name, "Disconnected from RabbitMQ");
        }
        Ok(())
    }

    async fn consume(&self, cancel_token: CancellationToken) -> Result<Deliveries, QueueError> {
        let channel = self.channel()?;
        let deliveries = channel
            .basic_consume(
                &self.config.queue,
                &self.name,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(amqp_failed("basic consume"))?;

        let (message_sender, messages) = mpsc::channel(DELIVERY_BUFFER);
        let (error_sender, errors) = mpsc::channel(DELIVERY_BUFFER);
        let pump_token = cancel_token.child_token();
        if let Some(previous) = self.state.lock().pump_token.replace(pump_token.clone()) {
            previous.cancel();
        }

        tokio::spawn(pump(
            self.config.queue.clone(),
            deliveries,
            message_sender,
            error_sender,
            pump_token,
        ));
        Ok(Deliveries { messages, errors })
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), QueueError> {
        let tag = Self::delivery_tag(message)?;
        self.channel()?
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(amqp_failed("basic ack"))
    }

    async fn reject(&self, message: &Message, requeue: bool) -> Result<(), QueueError> {
        let tag = Self::delivery_tag(message)?;
        let channel = self.channel()?;
        if !requeue {
            return channel
                .basic_nack(
                    tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    },
                )
                .await
                .map_err(amqp_failed("basic nack"));
        }

        let queue = self.config.queue.clone();
        let delay = message.retry_delay().unwrap_or(Duration::ZERO);
        let message = message.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let published = channel
                .basic_publish(
                    "",
                    &queue,
                    BasicPublishOptions::default(),
                    &message.body,
                    retry_properties(&message),
                )
                .await;
            let settled = match published {
                Ok(_) => channel.basic_ack(tag, BasicAckOptions::default()).await,
                Err(e) => {
                    warn!(error = ?e, message_id = %message.id, "Republish failed, requeueing on broker");
                    channel
                        .basic_nack(
                            tag,
                            BasicNackOptions {
                                multiple: false,
                                requeue: true,
                            },
                        )
                        .await
                }
            };
            if let Err(e) = settled {
                error!(error = ?e, message_id = %message.id, "Failed to settle requeued delivery");
            }
        });
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<(), QueueError> {
        let connection = self.config.connection.as_str();
        if !connection.starts_with("amqp://") && !connection.starts_with("amqps://") {
            return Err(QueueError::InvalidConfig {
                details: format!("rabbitmq connection must be an amqp:// URL: {}", connection),
            });
        }
        if self.config.queue.trim().is_empty() {
            return Err(QueueError::InvalidConfig {
                details: "rabbitmq queue name cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

//! In-process consumer backed by tokio channels.
//!
//! Messages pushed with [`MemoryConsumer::add_message`] are delivered in
//! order. Acknowledged and rejected messages are recorded so callers can
//! observe how each one was settled. A requeued message is delivered again
//! after its retry delay (100ms when none was requested).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::QueueError;
use crate::queue::{Consumer, ConsumerConfig, DELIVERY_BUFFER, Deliveries, Message};

const REQUEUE_DELAY: Duration = Duration::from_millis(100);

#[derive(Default)]
struct MemoryState {
    connected: bool,
    sender: Option<mpsc::Sender<Message>>,
    receiver: Option<mpsc::Receiver<Message>>,
    error_sender: Option<mpsc::Sender<QueueError>>,
    error_receiver: Option<mpsc::Receiver<QueueError>>,
    acknowledged: Vec<Message>,
    rejected: Vec<(Message, bool)>,
    /// Cancelled when the current connection closes.
    connection: CancellationToken,
}

impl MemoryState {
    /// Dropping the senders closes both channels exactly once.
    fn close(&mut self) {
        self.connected = false;
        self.sender = None;
        self.receiver = None;
        self.error_sender = None;
        self.error_receiver = None;
        self.connection.cancel();
    }
}

pub struct MemoryConsumer {
    name: String,
    config: ConsumerConfig,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConsumer {
    pub fn new(name: &str, config: ConsumerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn sender(&self) -> Result<mpsc::Sender<Message>, QueueError> {
        let state = self.state.lock();
        match (&state.sender, state.connected) {
            (Some(sender), true) => Ok(sender.clone()),
            _ => Err(QueueError::NotConnected {
                consumer: self.name.clone(),
            }),
        }
    }

    /// Queues `body` with a fresh id.
    pub async fn add_message(
        &self,
        body: impl Into<Vec<u8>>,
        attributes: HashMap<String, String>,
    ) -> Result<(), QueueError> {
        let mut message = Message::new(ulid::Ulid::new().to_string(), body, &self.name);
        message.attributes = attributes;
        self.enqueue(message).await
    }

    /// Queues a fully formed message.
    pub async fn enqueue(&self, message: Message) -> Result<(), QueueError> {
        let sender = self.sender()?;
        trace!(consumer = %self.name, message_id = %message.id, "Queueing message");
        sender
            .send(message)
            .await
            .map_err(|_| QueueError::NotConnected {
                consumer: self.name.clone(),
            })
    }

    pub fn acknowledged(&self) -> Vec<Message> {
        self.state.lock().acknowledged.clone()
    }

    pub fn rejected(&self) -> Vec<(Message, bool)> {
        self.state.lock().rejected.clone()
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn connect(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.connected {
            return Ok(());
        }
        let (sender, receiver) = mpsc::channel(DELIVERY_BUFFER);
        let (error_sender, error_receiver) = mpsc::channel(DELIVERY_BUFFER);
        state.sender = Some(sender);
        state.receiver = Some(receiver);
        state.error_sender = Some(error_sender);
        state.error_receiver = Some(error_receiver);
        state.connection = CancellationToken::new();
        state.connected = true;
        debug!(consumer = %self.name, "Memory consumer connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), QueueError> {
        self.state.lock().close();
        debug!(consumer = %self.name, "Memory consumer disconnected");
        Ok(())
    }

    async fn consume(&self, cancel_token: CancellationToken) -> Result<Deliveries, QueueError> {
        let (deliveries, connection) = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(QueueError::NotConnected {
                    consumer: self.name.clone(),
                });
            }
            match (state.receiver.take(), state.error_receiver.take()) {
                (Some(messages), Some(errors)) => {
                    (Deliveries { messages, errors }, state.connection.clone())
                }
                _ => {
                    return Err(QueueError::InvalidConfig {
                        details: format!("{} is already consuming", self.name),
                    });
                }
            }
        };

        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    let mut state = state.lock();
                    if !connection.is_cancelled() {
                        state.close();
                    }
                }
                () = connection.cancelled() => {}
            }
        });
        Ok(deliveries)
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), QueueError> {
        self.state.lock().acknowledged.push(message.clone());
        Ok(())
    }

    async fn reject(&self, message: &Message, requeue: bool) -> Result<(), QueueError> {
        self.state.lock().rejected.push((message.clone(), requeue));
        if !requeue {
            return Ok(());
        }

        let sender = self.sender()?;
        let message = message.clone();
        let delay = message.retry_delay().unwrap_or(REQUEUE_DELAY);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(message).await.is_err() {
                debug!("Memory consumer closed before requeue");
            }
        });
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

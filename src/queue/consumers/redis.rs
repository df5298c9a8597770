//! Redis consumer using the reliable-queue pattern.
//!
//! Producers `LPUSH` task bodies onto the queue list. The consumer moves
//! one item at a time into its own processing list with `RPOPLPUSH`, so a
//! crash never loses work:
//!
//! ```text
//! 1. RPOPLPUSH <queue> -> <queue>:processing:<worker>
//! 2. task runs
//! 3. acknowledge or final reject: LREM from the processing list
//! 4. requeue: LPUSH back onto <queue> after the retry delay, then LREM
//! 5. connect: anything left in the processing list goes back to <queue>
//! ```
//!
//! Retry counts survive requeueing in the `<queue>:retries` hash, keyed by
//! a digest of the body.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::{Connection, Pool, Runtime};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::parse_duration;
use crate::errors::QueueError;
use crate::queue::{Consumer, ConsumerConfig, DELIVERY_BUFFER, Deliveries, Message};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// List and hash names for one worker.
#[derive(Clone, Debug)]
struct RedisQueues {
    pool: Pool,
    worker_id: String,
    primary: String,
    processing: String,
    retries: String,
}

fn connection_failed(e: impl ToString) -> QueueError {
    QueueError::ConnectionFailed {
        queue_type: "redis".to_string(),
        details: e.to_string(),
    }
}

fn operation_failed(operation: &str) -> impl FnOnce(deadpool_redis::redis::RedisError) -> QueueError {
    let operation = operation.to_string();
    move |source| QueueError::RedisOperationFailed { operation, source }
}

/// Stable id for a body; redis lists carry no message ids.
fn body_digest(body: &[u8]) -> String {
    Sha256::digest(body)
        .iter()
        .take(16)
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

impl RedisQueues {
    async fn conn(&self) -> Result<Connection, QueueError> {
        self.pool.get().await.map_err(connection_failed)
    }

    /// Moves anything left in this worker's processing list back to the
    /// queue. Returns the number of items moved.
    async fn recover_worker_queue(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn().await?;
        let mut recovered = 0;
        loop {
            let item: Option<Vec<u8>> = conn
                .rpoplpush(&self.processing, &self.primary)
                .await
                .map_err(operation_failed("rpoplpush (recovery)"))?;
            if item.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            info!(
                worker_id = %self.worker_id,
                count = recovered,
                "Recovered items from processing list"
            );
        }
        Ok(recovered)
    }

    async fn pull(&self) -> Result<Option<Message>, QueueError> {
        let mut conn = self.conn().await?;
        let body: Option<Vec<u8>> = conn
            .rpoplpush(&self.primary, &self.processing)
            .await
            .map_err(operation_failed("rpoplpush"))?;
        let Some(body) = body else {
            return Ok(None);
        };

        let id = body_digest(&body);
        let retry_count: Option<u32> = conn
            .hget(&self.retries, &id)
            .await
            .map_err(operation_failed("hget (retry count)"))?;

        let mut message = Message::new(id, body, &self.primary);
        message.retry_count = retry_count.unwrap_or(0);
        trace!(message_id = %message.id, "Pulled message from Redis");
        Ok(Some(message))
    }

    async fn settle(&self, message: &Message) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        conn.lrem::<_, _, ()>(&self.processing, 1, message.body.as_slice())
            .await
            .map_err(operation_failed("lrem"))?;
        conn.hdel::<_, _, ()>(&self.retries, &message.id)
            .await
            .map_err(operation_failed("hdel (retry count)"))?;
        Ok(())
    }

    async fn requeue(&self, message: &Message) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(&self.retries, &message.id, message.retry_count)
            .await
            .map_err(operation_failed("hset (retry count)"))?;
        conn.lpush::<_, _, ()>(&self.primary, message.body.as_slice())
            .await
            .map_err(operation_failed("lpush (requeue)"))?;
        conn.lrem::<_, _, ()>(&self.processing, 1, message.body.as_slice())
            .await
            .map_err(operation_failed("lrem (requeue)"))?;
        Ok(())
    }

    async fn pump(
        self,
        poll_interval: Duration,
        messages: mpsc::Sender<Message>,
        errors: mpsc::Sender<QueueError>,
        cancel_token: CancellationToken,
    ) {
        loop {
            let pulled = tokio::select! {
                () = cancel_token.cancelled() => break,
                pulled = self.pull() => pulled,
            };

            match pulled {
                Ok(Some(message)) => {
                    if messages.send(message).await.is_err() {
                        break;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    if errors.send(e).await.is_err() {
                        break;
                    }
                }
            }

            tokio::select! {
                () = cancel_token.cancelled() => break,
                () = tokio::time::sleep(poll_interval) => {}
            }
        }
        debug!(worker_id = %self.worker_id, "Redis pump stopped");
    }
}

#[derive(Default)]
struct RedisState {
    queues: Option<RedisQueues>,
    pump_token: Option<CancellationToken>,
}

pub struct RedisConsumer {
    name: String,
    config: ConsumerConfig,
    worker_id: String,
    state: Mutex<RedisState>,
}

impl RedisConsumer {
    pub fn new(name: &str, config: ConsumerConfig) -> Self {
        let worker_id = config
            .options
            .get("worker_id")
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            name: name.to_string(),
            config,
            worker_id,
            state: Mutex::new(RedisState::default()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn processing_list_name(&self) -> String {
        format!("{}:processing:{}", self.config.queue, self.worker_id)
    }

    fn poll_interval(&self) -> Result<Duration, QueueError> {
        match self.config.options.get("poll_interval") {
            None => Ok(DEFAULT_POLL_INTERVAL),
            Some(value) => parse_duration(value).map_err(|e| QueueError::InvalidConfig {
                details: e.to_string(),
            }),
        }
    }

    fn queues(&self) -> Result<RedisQueues, QueueError> {
        self.state
            .lock()
            .queues
            .clone()
            .ok_or_else(|| QueueError::NotConnected {
                consumer: self.name.clone(),
            })
    }
}

#[async_trait]
impl Consumer for RedisConsumer {
    async fn connect(&self) -> Result<(), QueueError> {
        if self.state.lock().queues.is_some() {
            return Ok(());
        }

        let pool = deadpool_redis::Config::from_url(self.config.connection.as_str())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(connection_failed)?;
        let queues = RedisQueues {
            pool,
            worker_id: self.worker_id.clone(),
            primary: self.config.queue.clone(),
            processing: self.processing_list_name(),
            retries: format!("{}:retries", self.config.queue),
        };

        let mut conn = queues.conn().await?;
        deadpool_redis::redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(operation_failed("ping"))?;
        drop(conn);

        queues.recover_worker_queue().await?;
        info!(
            consumer = %self.name,
            queue = %queues.primary,
            worker_id = %self.worker_id,
            "Connected to Redis"
        );
        self.state.lock().queues = Some(queues);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if let Some(token) = state.pump_token.take() {
            token.cancel();
        }
        if let Some(queues) = state.queues.take() {
            queues.pool.close();
            debug!(consumer = %self.name, "Disconnected from Redis");
        }
        Ok(())
    }

    async fn consume(&self, cancel_token: CancellationToken) -> Result<Deliveries, QueueError> {
        let queues = self.queues()?;
        let poll_interval = self.poll_interval()?;

        let (message_sender, messages) = mpsc::channel(DELIVERY_BUFFER);
        let (error_sender, errors) = mpsc::channel(DELIVERY_BUFFER);
        let pump_token = cancel_token.child_token();
        {
            let mut state = self.state.lock();
            if let Some(previous) = state.pump_token.replace(pump_token.clone()) {
                previous.cancel();
            }
        }

        tokio::spawn(queues.pump(poll_interval, message_sender, error_sender, pump_token));
        Ok(Deliveries { messages, errors })
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), QueueError> {
        self.queues()?.settle(message).await
    }

    async fn reject(&self, message: &Message, requeue: bool) -> Result<(), QueueError> {
        let queues = self.queues()?;
        if !requeue {
            warn!(consumer = %self.name, message_id = %message.id, "Dropping rejected message");
            return queues.settle(message).await;
        }

        let delay = message.retry_delay().unwrap_or_default();
        let message = message.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queues.requeue(&message).await {
                // The item stays in the processing list and is recovered on
                // the next connect.
                error!(error = ?e, message_id = %message.id, "Failed to requeue message");
            }
        });
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<(), QueueError> {
        if !self.config.connection.starts_with("redis://")
            && !self.config.connection.starts_with("rediss://")
        {
            return Err(QueueError::InvalidConfig {
                details: format!("redis connection must be a redis:// URL: {}", self.config.connection),
            });
        }
        if self.config.queue.trim().is_empty() {
            return Err(QueueError::InvalidConfig {
                details: "redis queue name cannot be empty".to_string(),
            });
        }
        self.poll_interval().map(|_| ())
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::parser::{JsonMessageParser, MessageParser};
use super::retry::{ExponentialBackoff, RetryPolicy};
use super::{Consumer, Message, RETRY_DELAY_ATTRIBUTE, TaskMessage};
use crate::errors::{QueueError, TaskError};

/// Runs a parsed task through the prompt, model and processor pipeline.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(
        &self,
        task: &TaskMessage,
        cancel_token: &CancellationToken,
    ) -> Result<(), TaskError>;
}

/// Snapshot of the coordinator counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub processed: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub retried: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    acknowledged: AtomicU64,
    rejected: AtomicU64,
    retried: AtomicU64,
}

/// State shared by every consumer loop.
struct Dispatch {
    processor: Arc<dyn TaskProcessor>,
    parser: Arc<dyn MessageParser>,
    retry_policy: Arc<dyn RetryPolicy>,
    counters: Counters,
}

struct ConsumerEntry {
    consumer: Arc<dyn Consumer>,
    cancel_token: Option<CancellationToken>,
}

/// Supervises a set of consumers, one loop each.
pub struct Coordinator {
    dispatch: Arc<Dispatch>,
    consumers: RwLock<HashMap<String, ConsumerEntry>>,
    running: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
}

impl Coordinator {
    pub fn new(processor: Arc<dyn TaskProcessor>) -> Self {
        Self {
            dispatch: Arc::new(Dispatch {
                processor,
                parser: Arc::new(JsonMessageParser),
                retry_policy: Arc::new(ExponentialBackoff::default()),
                counters: Counters::default(),
            }),
            consumers: RwLock::new(HashMap::new()),
            running: Mutex::new(None),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn MessageParser>) -> Self {
        self.dispatch = Arc::new(Dispatch {
            parser,
            processor: self.dispatch.processor.clone(),
            retry_policy: self.dispatch.retry_policy.clone(),
            counters: Counters::default(),
        });
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.dispatch = Arc::new(Dispatch {
            retry_policy,
            processor: self.dispatch.processor.clone(),
            parser: self.dispatch.parser.clone(),
            counters: Counters::default(),
        });
        self
    }

    /// Registers a consumer. When the coordinator is running, its loop
    /// starts immediately.
    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<(), QueueError> {
        let name = consumer.name().to_string();
        if name.trim().is_empty() {
            return Err(QueueError::InvalidConfig {
                details: "consumer name cannot be empty".to_string(),
            });
        }

        let running = self.running.lock();
        let mut consumers = self.consumers.write();
        if consumers.contains_key(&name) {
            return Err(QueueError::ConsumerExists { consumer: name });
        }

        let cancel_token = running
            .as_ref()
            .map(|parent| self.spawn_loop(consumer.clone(), parent));
        consumers.insert(
            name.clone(),
            ConsumerEntry {
                consumer,
                cancel_token,
            },
        );
        info!(consumer = %name, "Added queue consumer");
        Ok(())
    }

    /// Detaches a consumer, stopping its loop if one is running.
    pub fn remove_consumer(&self, name: &str) -> Result<(), QueueError> {
        let entry = self
            .consumers
            .write()
            .remove(name)
            .ok_or_else(|| QueueError::ConsumerNotFound {
                consumer: name.to_string(),
            })?;
        if let Some(token) = entry.cancel_token {
            token.cancel();
        }
        info!(consumer = name, "Removed queue consumer");
        Ok(())
    }

    pub fn consumer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.consumers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let counters = &self.dispatch.counters;
        CoordinatorStats {
            processed: counters.processed.load(Ordering::Relaxed),
            acknowledged: counters.acknowledged.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
        }
    }

    /// Launches one loop per registered consumer under a child of
    /// `parent_token`.
    pub fn start(&self, parent_token: &CancellationToken) -> Result<(), QueueError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(QueueError::AlreadyRunning);
        }

        let mut consumers = self.consumers.write();
        if consumers.is_empty() {
            return Err(QueueError::NoConsumers);
        }

        let token = parent_token.child_token();
        self.tracker.reopen();
        for entry in consumers.values_mut() {
            entry.cancel_token = Some(self.spawn_loop(entry.consumer.clone(), &token));
        }
        info!(consumers = consumers.len(), "Queue coordinator started");
        *running = Some(token);
        Ok(())
    }

    /// Cancels every loop and waits up to `timeout` for them to return.
    pub async fn stop(&self, timeout: Duration) -> Result<(), QueueError> {
        let token = self.running.lock().take();
        let Some(token) = token else {
            return Ok(());
        };

        token.cancel();
        for entry in self.consumers.write().values_mut() {
            entry.cancel_token = None;
        }
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("Queue coordinator stopped");
                Ok(())
            }
            Err(_) => {
                warn!(timeout = ?timeout, "Queue consumers did not stop in time");
                Err(QueueError::ShutdownTimeout)
            }
        }
    }

    fn spawn_loop(
        &self,
        consumer: Arc<dyn Consumer>,
        parent_token: &CancellationToken,
    ) -> CancellationToken {
        let token = parent_token.child_token();
        let dispatch = self.dispatch.clone();
        let loop_token = token.clone();
        self.tracker.spawn(async move {
            dispatch.run_consumer(consumer, loop_token).await;
        });
        token
    }
}

impl Dispatch {
    #[instrument(skip(self, consumer, cancel_token), fields(consumer = %consumer.name()))]
    async fn run_consumer(&self, consumer: Arc<dyn Consumer>, cancel_token: CancellationToken) {
        if let Err(e) = consumer.connect().await {
            error!(error = ?e, "Failed to connect queue consumer");
            return;
        }

        match consumer.consume(cancel_token.clone()).await {
            Ok(mut deliveries) => loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        debug!("Consumer loop cancelled");
                        break;
                    }
                    error = deliveries.errors.recv() => match error {
                        Some(e) => error!(error = ?e, "Queue consumer error"),
                        None => {
                            debug!("Consumer error channel closed");
                            break;
                        }
                    },
                    message = deliveries.messages.recv() => match message {
                        Some(message) => {
                            self.process_message(consumer.as_ref(), message, &cancel_token)
                                .await
                        }
                        None => {
                            debug!("Consumer message channel closed");
                            break;
                        }
                    },
                }
            },
            Err(e) => error!(error = ?e, "Failed to start consuming"),
        }

        if let Err(e) = consumer.disconnect().await {
            warn!(error = ?e, "Failed to disconnect queue consumer");
        }
    }

    async fn reject(&self, consumer: &dyn Consumer, message: &Message, requeue: bool) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = consumer.reject(message, requeue).await {
            error!(error = ?e, message_id = %message.id, requeue, "Failed to reject message");
        }
    }

    async fn process_message(
        &self,
        consumer: &dyn Consumer,
        mut message: Message,
        cancel_token: &CancellationToken,
    ) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let task = match self.parser.parse(&message) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = ?e, message_id = %message.id, "Rejecting unparseable message");
                self.reject(consumer, &message, false).await;
                return;
            }
        };

        if let Err(e) = task.validate() {
            warn!(error = ?e, message_id = %message.id, "Rejecting invalid task");
            self.reject(consumer, &message, false).await;
            return;
        }

        debug!(
            message_id = %message.id,
            model = %task.model,
            prompt = %task.prompt,
            processor = %task.processor,
            "Processing task"
        );

        match self.processor.process(&task, cancel_token).await {
            Ok(()) => {
                self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = consumer.acknowledge(&message).await {
                    error!(error = ?e, message_id = %message.id, "Failed to acknowledge message");
                }
            }
            Err(e) if self.retry_policy.should_retry(&message, &e) => {
                message.retry_count += 1;
                let delay = self.retry_policy.next_retry_delay(&message);
                message.attributes.insert(
                    RETRY_DELAY_ATTRIBUTE.to_string(),
                    delay.as_millis().to_string(),
                );
                warn!(
                    error = ?e,
                    message_id = %message.id,
                    retry_count = message.retry_count,
                    delay = ?delay,
                    "Task failed, requeueing"
                );
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                self.reject(consumer, &message, true).await;
            }
            Err(e) => {
                error!(
                    error = ?e,
                    message_id = %message.id,
                    retry_count = message.retry_count,
                    "Task failed permanently"
                );
                self.reject(consumer, &message, false).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{CategorizedError, ErrorCategory};
    use crate::queue::consumers::MemoryConsumer;
    use crate::queue::retry::{ExponentialBackoff, LinearRetry};
    use crate::queue::ConsumerConfig;
    use crate::test_helpers::wait_until;

    #[derive(Default)]
    struct RecordingProcessor {
        tasks: Mutex<Vec<TaskMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl TaskProcessor for RecordingProcessor {
        async fn process(&self, task: &TaskMessage, _: &CancellationToken) -> Result<(), TaskError> {
            self.tasks.lock().push(task.clone());
            if self.fail {
                return Err(CategorizedError::new(ErrorCategory::External, "upstream down").into());
            }
            Ok(())
        }
    }

    fn memory(name: &str) -> Arc<MemoryConsumer> {
        Arc::new(MemoryConsumer::new(
            name,
            ConsumerConfig::new("memory", "memory://", "tasks"),
        ))
    }

    #[tokio::test]
    async fn test_add_and_remove_consumers() {
        let coordinator = Coordinator::new(Arc::new(RecordingProcessor::default()));
        coordinator.add_consumer(memory("a")).unwrap();
        assert!(matches!(
            coordinator.add_consumer(memory("a")),
            Err(QueueError::ConsumerExists { .. })
        ));
        assert!(matches!(
            coordinator.add_consumer(memory(" ")),
            Err(QueueError::InvalidConfig { .. })
        ));
        assert_eq!(coordinator.consumer_names(), vec!["a"]);

        coordinator.remove_consumer("a").unwrap();
        assert!(matches!(
            coordinator.remove_consumer("a"),
            Err(QueueError::ConsumerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_requires_consumers() {
        let coordinator = Coordinator::new(Arc::new(RecordingProcessor::default()));
        assert!(matches!(
            coordinator.start(&CancellationToken::new()),
            Err(QueueError::NoConsumers)
        ));
        assert!(coordinator.stop(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_valid_message_is_acknowledged() {
        let processor = Arc::new(RecordingProcessor::default());
        let coordinator = Coordinator::new(processor.clone());
        let consumer = memory("mem");
        coordinator.add_consumer(consumer.clone()).unwrap();
        coordinator.start(&CancellationToken::new()).unwrap();
        assert!(matches!(
            coordinator.start(&CancellationToken::new()),
            Err(QueueError::AlreadyRunning)
        ));

        wait_until(|| consumer.is_connected()).await;
        consumer
            .add_message(
                r#"{"model":"openai","prompt":"test_prompt","processor":"console"}"#,
                HashMap::new(),
            )
            .await
            .unwrap();
        wait_until(|| consumer.acknowledged().len() == 1).await;

        coordinator.stop(Duration::from_secs(2)).await.unwrap();
        assert!(consumer.rejected().is_empty());
        assert_eq!(processor.tasks.lock()[0].prompt, "test_prompt");
        assert_eq!(
            coordinator.stats(),
            CoordinatorStats {
                processed: 1,
                acknowledged: 1,
                rejected: 0,
                retried: 0
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_message_is_rejected_without_processing() {
        let processor = Arc::new(RecordingProcessor::default());
        let coordinator = Coordinator::new(processor.clone());
        let consumer = memory("mem");
        coordinator.add_consumer(consumer.clone()).unwrap();
        coordinator.start(&CancellationToken::new()).unwrap();

        wait_until(|| consumer.is_connected()).await;
        consumer
            .add_message(r#"{"model":"","prompt":"p","processor":"console"}"#, HashMap::new())
            .await
            .unwrap();
        consumer.add_message("{broken", HashMap::new()).await.unwrap();
        wait_until(|| consumer.rejected().len() == 2).await;

        coordinator.stop(Duration::from_secs(2)).await.unwrap();
        assert!(consumer.acknowledged().is_empty());
        assert!(consumer.rejected().iter().all(|(_, requeue)| !requeue));
        assert!(processor.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_is_requeued_until_exhausted() {
        let processor = Arc::new(RecordingProcessor {
            fail: true,
            ..Default::default()
        });
        let coordinator = Coordinator::new(processor.clone())
            .with_retry_policy(Arc::new(LinearRetry::new(2, Duration::from_millis(10))));
        let consumer = memory("mem");
        coordinator.add_consumer(consumer.clone()).unwrap();
        coordinator.start(&CancellationToken::new()).unwrap();

        wait_until(|| consumer.is_connected()).await;
        consumer
            .add_message(
                r#"{"model":"claude","prompt":"p","processor":"console"}"#,
                HashMap::new(),
            )
            .await
            .unwrap();
        wait_until(|| consumer.rejected().len() == 3).await;
        coordinator.stop(Duration::from_secs(2)).await.unwrap();

        let requeues: Vec<(u32, bool)> = consumer
            .rejected()
            .iter()
            .map(|(message, requeue)| (message.retry_count, *requeue))
            .collect();
        assert_eq!(requeues, vec![(1, true), (2, true), (2, false)]);
        assert_eq!(processor.tasks.lock().len(), 3);
        assert_eq!(coordinator.stats().retried, 2);
    }

    #[tokio::test]
    async fn test_exhausted_message_is_not_retried() {
        let coordinator = Coordinator::new(Arc::new(RecordingProcessor {
            fail: true,
            ..Default::default()
        }))
        .with_retry_policy(Arc::new(ExponentialBackoff::new(
            2,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )));
        let consumer = memory("mem");
        coordinator.add_consumer(consumer.clone()).unwrap();
        coordinator.start(&CancellationToken::new()).unwrap();

        wait_until(|| consumer.is_connected()).await;
        let message = Message {
            retry_count: 2,
            ..Message::new(
                "exhausted",
                r#"{"model":"gemini","prompt":"p","processor":"console"}"#,
                "memory",
            )
        };
        consumer.enqueue(message).await.unwrap();
        wait_until(|| consumer.rejected().len() == 1).await;
        coordinator.stop(Duration::from_secs(2)).await.unwrap();

        let rejected = consumer.rejected();
        assert_eq!(rejected[0].0.retry_count, 2);
        assert!(!rejected[0].1);
        assert_eq!(coordinator.stats().retried, 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_loops() {
        let coordinator = Coordinator::new(Arc::new(RecordingProcessor::default()));
        let consumer = memory("mem");
        coordinator.add_consumer(consumer.clone()).unwrap();
        let parent = CancellationToken::new();
        coordinator.start(&parent).unwrap();
        wait_until(|| consumer.is_connected()).await;

        parent.cancel();
        wait_until(|| !consumer.is_connected()).await;
        coordinator.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!coordinator.is_running());
    }
}

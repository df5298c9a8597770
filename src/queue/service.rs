use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::config::{QueueTask, load_queue_file, queue_task_from_env};
use super::coordinator::{Coordinator, TaskProcessor};
use super::registry::ConsumerRegistry;
use super::retry::ExponentialBackoff;
use crate::config::QueueEnvConfig;
use crate::errors::QueueError;

/// Upper bound for the exponential backoff between retries.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Queue mode: a coordinator plus the consumers built from configuration.
pub struct QueueService {
    coordinator: Coordinator,
}

impl QueueService {
    /// Builds one consumer per task. The retry policy follows the first
    /// task's `retry_limit` and `retry_delay`.
    pub fn new(
        processor: Arc<dyn TaskProcessor>,
        registry: &ConsumerRegistry,
        tasks: Vec<QueueTask>,
    ) -> Result<Self, QueueError> {
        let first = tasks.first().ok_or(QueueError::NoConsumers)?;
        let policy = ExponentialBackoff::new(
            first.config.retry_limit,
            first.config.retry_delay,
            MAX_RETRY_DELAY,
        );
        let coordinator = Coordinator::new(processor).with_retry_policy(Arc::new(policy));

        for task in tasks {
            info!(
                consumer = %task.name,
                queue_type = %task.config.queue_type,
                queue = %task.config.queue,
                "Creating queue consumer"
            );
            let consumer = registry.create_consumer(&task.name, task.config)?;
            coordinator.add_consumer(consumer)?;
        }

        Ok(Self { coordinator })
    }

    /// Queue definitions from `config_path` when it has any, otherwise from
    /// `QUEUE_*` variables, otherwise a single in-memory consumer.
    pub fn load_tasks(config_path: Option<&Path>) -> Result<Vec<QueueTask>, QueueError> {
        if let Some(path) = config_path {
            let tasks = load_queue_file(path)?;
            if !tasks.is_empty() {
                return Ok(tasks);
            }
        }

        let env = QueueEnvConfig::from_env().map_err(|e| QueueError::InvalidConfig {
            details: e.to_string(),
        })?;
        if env.is_none() {
            info!("No queue configuration found, using an in-memory consumer");
        }
        Ok(vec![queue_task_from_env(env)?])
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Runs until `cancel_token` fires, then stops the consumers.
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<(), QueueError> {
        self.coordinator.start(&cancel_token)?;
        info!(
            consumers = ?self.coordinator.consumer_names(),
            "Queue service started"
        );

        cancel_token.cancelled().await;
        info!("Shutting down queue service");
        self.coordinator.stop(SHUTDOWN_TIMEOUT).await?;

        let stats = self.coordinator.stats();
        info!(
            processed = stats.processed,
            acknowledged = stats.acknowledged,
            rejected = stats.rejected,
            retried = stats.retried,
            "Queue service stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TaskError;
    use crate::queue::TaskMessage;
    use crate::queue::config::parse_queue_line;
    use crate::test_helpers::ENV_MUTEX;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl TaskProcessor for Noop {
        async fn process(&self, _: &TaskMessage, _: &CancellationToken) -> Result<(), TaskError> {
            Ok(())
        }
    }

    #[test]
    fn test_load_tasks_prefers_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cronai.config");
        std::fs::write(
            &path,
            "# schedule\n0 8 * * * openai daily console\nqueue jobs redis redis://cache:6379 work\n",
        )
        .unwrap();

        let tasks = QueueService::load_tasks(Some(&path)).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, "jobs");
        assert_eq!(tasks[0].config.queue_type, "redis");
    }

    #[test]
    fn test_load_tasks_defaults_to_memory() {
        let _guard = ENV_MUTEX.lock();
        unsafe {
            std::env::remove_var("QUEUE_TYPE");
        }
        let tasks = QueueService::load_tasks(None).unwrap();
        assert_eq!(tasks[0].name, "memory-cronai-tasks");
    }

    #[test]
    fn test_new_rejects_unknown_types() {
        let registry = ConsumerRegistry::new();
        let task = parse_queue_line("queue q kafka kafka://broker jobs")
            .unwrap()
            .unwrap();
        assert!(matches!(
            QueueService::new(Arc::new(Noop), &registry, vec![task]),
            Err(QueueError::UnsupportedType { .. })
        ));
        assert!(matches!(
            QueueService::new(Arc::new(Noop), &registry, Vec::new()),
            Err(QueueError::NoConsumers)
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let registry = ConsumerRegistry::new();
        let task = parse_queue_line("queue q memory memory:// jobs retry_limit=1")
            .unwrap()
            .unwrap();
        let service = QueueService::new(Arc::new(Noop), &registry, vec![task]).unwrap();

        let token = CancellationToken::new();
        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        crate::test_helpers::with_timeout(Duration::from_secs(5), service.run(token))
            .await
            .unwrap()
            .unwrap();
        assert!(!service.coordinator().is_running());
    }
}

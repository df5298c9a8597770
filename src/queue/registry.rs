use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::consumers::{AmqpConsumer, MemoryConsumer, RedisConsumer};
use super::{Consumer, ConsumerConfig};
use crate::errors::QueueError;

/// Builds a consumer from its name and configuration.
pub type ConsumerFactory =
    Arc<dyn Fn(&str, ConsumerConfig) -> Result<Arc<dyn Consumer>, QueueError> + Send + Sync>;

pub fn consumer_factory<F>(factory: F) -> ConsumerFactory
where
    F: Fn(&str, ConsumerConfig) -> Result<Arc<dyn Consumer>, QueueError> + Send + Sync + 'static,
{
    Arc::new(factory)
}

/// Maps queue type names to consumer factories.
pub struct ConsumerRegistry {
    factories: RwLock<HashMap<String, ConsumerFactory>>,
}

impl Default for ConsumerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerRegistry {
    /// A registry with `memory`, `rabbitmq` (alias `amqp`) and `redis`.
    pub fn new() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
        };
        registry.register(
            "memory",
            consumer_factory(|name, config| Ok(Arc::new(MemoryConsumer::new(name, config)))),
        );
        let amqp = consumer_factory(|name, config| Ok(Arc::new(AmqpConsumer::new(name, config))));
        registry.register("rabbitmq", amqp.clone());
        registry.register("amqp", amqp);
        registry.register(
            "redis",
            consumer_factory(|name, config| Ok(Arc::new(RedisConsumer::new(name, config)))),
        );
        registry
    }

    pub fn register(&self, queue_type: &str, factory: ConsumerFactory) {
        self.factories
            .write()
            .insert(queue_type.to_lowercase(), factory);
        debug!(queue_type, "Registered consumer type");
    }

    /// Builds and validates a consumer.
    pub fn create_consumer(
        &self,
        name: &str,
        config: ConsumerConfig,
    ) -> Result<Arc<dyn Consumer>, QueueError> {
        let required = [
            ("type", &config.queue_type),
            ("connection", &config.connection),
            ("queue", &config.queue),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(field, _)| *field)
            .collect();
        if !missing.is_empty() {
            return Err(QueueError::InvalidConfig {
                details: format!("missing {}", missing.join(", ")),
            });
        }

        let queue_type = config.queue_type.to_lowercase();
        let factory = self
            .factories
            .read()
            .get(&queue_type)
            .cloned()
            .ok_or(QueueError::UnsupportedType { queue_type })?;

        let consumer = factory(name, config)?;
        consumer.validate()?;
        Ok(consumer)
    }

    pub fn queue_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_types() {
        assert_eq!(
            ConsumerRegistry::new().queue_types(),
            vec!["amqp", "memory", "rabbitmq", "redis"]
        );
    }

    #[test]
    fn test_create_consumer() {
        let registry = ConsumerRegistry::new();

        let consumer = registry
            .create_consumer(
                "rabbitmq-jobs",
                ConsumerConfig::new("RabbitMQ", "amqp://localhost", "jobs"),
            )
            .unwrap();
        assert_eq!(consumer.name(), "rabbitmq-jobs");

        assert!(matches!(
            registry.create_consumer("x", ConsumerConfig::new("kafka", "kafka://", "jobs")),
            Err(QueueError::UnsupportedType { .. })
        ));
        assert!(matches!(
            registry.create_consumer("x", ConsumerConfig::new("memory", "", "")),
            Err(QueueError::InvalidConfig { .. })
        ));
        assert!(matches!(
            registry.create_consumer("x", ConsumerConfig::new("redis", "amqp://wrong", "jobs")),
            Err(QueueError::InvalidConfig { .. })
        ));
    }
}

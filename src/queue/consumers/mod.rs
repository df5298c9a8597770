//! Queue transports.
//!
//! - [`MemoryConsumer`]: tokio channels inside the process, used by tests
//!   and single-instance setups.
//! - [`AmqpConsumer`]: RabbitMQ through `lapin`, durable queue, prefetch 1,
//!   manual acknowledgement.
//! - [`RedisConsumer`]: Redis lists with the reliable-queue pattern.

mod amqp;
mod memory;
mod redis;

pub use amqp::AmqpConsumer;
pub use memory::MemoryConsumer;
pub use redis::RedisConsumer;

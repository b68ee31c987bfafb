//! Durable event publication: bus abstraction and the outbox daemon.

pub mod bus;
pub mod publisher;

pub use bus::{MessageBus, RabbitMqBus};
pub use publisher::{OutboxPublisher, PublisherStats};

//! Message bus abstraction and the RabbitMQ implementation.
//!
//! Publication is confirm-based: `publish` resolves only after the broker
//! acknowledges the message, so callers can safely mark outbox entries
//! published once it returns.

use async_trait::async_trait;
use lapin::{
    options::{
        BasicGetOptions, BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::BusConfig;
use crate::error::{LifelineError, Result};

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish and wait for broker acknowledgement
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;

    /// Pull one message if available
    async fn receive(&self, topic: &str) -> Result<Option<Vec<u8>>>;

    /// Declare a durable topic, idempotently
    async fn ensure_topic(&self, topic: &str) -> Result<()>;
}

pub struct RabbitMqBus {
    connection: Connection,
    channel: Mutex<Channel>,
}

impl RabbitMqBus {
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let connection =
            Connection::connect(&config.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        // Publisher confirms: basic_publish yields a confirmation future
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        info!("Connected to message bus at {}", config.url);

        Ok(Self {
            connection,
            channel: Mutex::new(channel),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close(200, "shutting down").await?;
        info!("Message bus connection closed");
        Ok(())
    }
}

#[async_trait]
impl MessageBus for RabbitMqBus {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let channel = self.channel.lock().await;
        let confirm = channel
            .basic_publish(
                "",
                topic,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2) // persistent
                    .with_message_id(key.into()),
            )
            .await?;
        confirm.await?;
        debug!("Published {} to {}", key, topic);
        Ok(())
    }

    async fn receive(&self, topic: &str) -> Result<Option<Vec<u8>>> {
        let channel = self.channel.lock().await;
        match channel.basic_get(topic, BasicGetOptions::default()).await {
            Ok(Some(delivery)) => {
                let data = delivery.data.clone();
                delivery.ack(Default::default()).await?;
                Ok(Some(data))
            }
            Ok(None) => Ok(None),
            Err(e) if e.to_string().contains("NOT_FOUND") => {
                debug!("Topic {} does not exist yet", topic);
                Ok(None)
            }
            Err(e) => Err(LifelineError::from(e)),
        }
    }

    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        let channel = self.channel.lock().await;
        channel
            .queue_declare(
                topic,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!("Declared topic {}", topic);
        Ok(())
    }
}

/// In-process bus for tests: records publications and can be told to
/// reject specific topics.
pub mod testing {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq)]
    pub struct RecordedMessage {
        pub topic: String,
        pub key: String,
        pub payload: Vec<u8>,
    }

    #[derive(Default)]
    pub struct InMemoryBus {
        published: StdMutex<Vec<RecordedMessage>>,
        queues: StdMutex<HashMap<String, VecDeque<Vec<u8>>>>,
        failing_topics: StdMutex<HashSet<String>>,
    }

    impl InMemoryBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_topic(&self, topic: &str) {
            self.failing_topics
                .lock()
                .unwrap()
                .insert(topic.to_string());
        }

        pub fn heal_topic(&self, topic: &str) {
            self.failing_topics.lock().unwrap().remove(topic);
        }

        pub fn published(&self) -> Vec<RecordedMessage> {
            self.published.lock().unwrap().clone()
        }

        pub fn push(&self, topic: &str, payload: Vec<u8>) {
            self.queues
                .lock()
                .unwrap()
                .entry(topic.to_string())
                .or_default()
                .push_back(payload);
        }
    }

    #[async_trait]
    impl MessageBus for InMemoryBus {
        async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
            if self.failing_topics.lock().unwrap().contains(topic) {
                return Err(LifelineError::Bus(format!("topic {topic} unavailable")));
            }
            self.published.lock().unwrap().push(RecordedMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                payload: payload.to_vec(),
            });
            Ok(())
        }

        async fn receive(&self, topic: &str) -> Result<Option<Vec<u8>>> {
            Ok(self
                .queues
                .lock()
                .unwrap()
                .get_mut(topic)
                .and_then(|q| q.pop_front()))
        }

        async fn ensure_topic(&self, _topic: &str) -> Result<()> {
            Ok(())
        }
    }
}

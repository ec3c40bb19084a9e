//! Broker adapters behind the streaming bridge.
//!
//! Two seams insulate sessions from broker specifics:
//!
//! - [`AckBroker`] is the session adapter for persistent, ack-based brokers
//!   (NATS JetStream, the in-memory broker). The consume and produce bridges
//!   in [`crate::session`] drive it directly.
//! - [`AsyncSourceFactory`] / [`AsyncSinkFactory`] build self-contained
//!   sources and sinks for brokers whose client library already offers the
//!   confirm-then-commit semantics (Kafka). They are wrapped by
//!   [`SourceConsumeHandler`] / [`SinkProduceHandler`].
//!
//! [`build_handlers`] picks the adapter for the configured backend.

mod config;
mod error;
mod factory;
mod id;
mod kafka;
mod memory;
mod nats;

pub use config::{BackendConfig, BackendKind, KafkaConfig, MemoryConfig, NatsConfig};
pub use error::{BackendError, BackendResult};
pub use factory::{
    AsyncMessageSink, AsyncMessageSource, AsyncSinkFactory, AsyncSourceFactory, SinkProduceHandler,
    SourceConsumeHandler,
};
pub use id::{IdSource, SequentialIdSource, UuidIdSource};
pub use kafka::{KafkaSinkFactory, KafkaSourceFactory};
pub use memory::{AckRecord, MemoryBroker};
pub use nats::NatsBroker;

use crate::session::{
    AckConsumeHandler, AckProduceHandler, ConsumeHandler, ConsumeSettings, Offset, ProduceHandler,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Options for one durable, queue-grouped subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub topic: String,
    /// Queue group, also the durable subscription name
    pub group: String,
    pub start: Offset,
    /// Broker redelivers a message not acknowledged within this window
    pub ack_wait: Duration,
    /// Broker-side cap on unacknowledged deliveries
    pub max_inflight: usize,
}

/// Session adapter for a persistent, ack-based broker
#[async_trait]
pub trait AckBroker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a connection owned by one session
    async fn connect(&self, client_id: &str) -> BackendResult<Box<dyn BrokerConnection>>;
}

/// One session's handle on the broker
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn queue_subscribe(&self, options: SubscribeOptions) -> BackendResult<Box<dyn Subscription>>;

    /// Publish and wait until the broker accepted the payload
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BackendResult<()>;

    /// Resolves once the link to the broker is lost
    async fn disconnected(&self);

    async fn close(&self) -> BackendResult<()>;
}

/// Deliveries of a queue subscription in broker order
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` when the broker ended the subscription.
    ///
    /// Must be cancel safe.
    async fn next(&mut self) -> Option<BackendResult<Box<dyn Delivery>>>;

    async fn close(&mut self) -> BackendResult<()>;
}

/// A delivered message awaiting acknowledgement
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Broker sequence, unique and increasing within the subscription
    fn sequence(&self) -> u64;

    fn payload(&self) -> &[u8];

    async fn ack(&self) -> BackendResult<()>;
}

/// Session handlers for the configured backend
#[derive(Clone)]
pub struct Handlers {
    pub consume: Arc<dyn ConsumeHandler>,
    pub produce: Arc<dyn ProduceHandler>,
}

impl Handlers {
    /// Both directions served by one ack-based broker
    pub fn for_broker(broker: Arc<dyn AckBroker>, ids: Arc<dyn IdSource>, settings: ConsumeSettings) -> Self {
        Self {
            consume: Arc::new(AckConsumeHandler::new(broker.clone(), ids.clone(), settings)),
            produce: Arc::new(AckProduceHandler::new(broker, ids)),
        }
    }
}

/// Connect to the configured backend and build its session handlers.
///
/// Fails before any session starts if the broker cannot be reached.
pub async fn build_handlers(config: &BackendConfig, ids: Arc<dyn IdSource>) -> BackendResult<Handlers> {
    config.validate()?;

    match config.kind {
        BackendKind::Nats => {
            let broker = NatsBroker::connect(config.nats.clone(), ids.as_ref()).await?;
            tracing::info!(url = %config.nats.url, "Connected to NATS JetStream");
            Ok(Handlers::for_broker(
                Arc::new(broker),
                ids,
                ConsumeSettings::new(config.nats.max_inflight, config.nats.ack_wait()),
            ))
        }
        BackendKind::Kafka => {
            tracing::info!(brokers = ?config.kafka.brokers, "Using Kafka backend");
            Ok(Handlers {
                consume: Arc::new(SourceConsumeHandler::new(KafkaSourceFactory::new(
                    config.kafka.clone(),
                ))),
                produce: Arc::new(SinkProduceHandler::new(KafkaSinkFactory::new(
                    config.kafka.clone(),
                ))),
            })
        }
        BackendKind::Mem => {
            tracing::info!("Using in-memory backend");
            Ok(Handlers::for_broker(
                Arc::new(MemoryBroker::new()),
                ids,
                ConsumeSettings::new(config.mem.max_inflight, config.mem.ack_wait()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_mem_handlers() {
        let config = BackendConfig {
            kind: BackendKind::Mem,
            ..Default::default()
        };

        let handlers = build_handlers(&config, Arc::new(UuidIdSource)).await.unwrap();
        assert_eq!(handlers.consume.backend(), "mem");
        assert_eq!(handlers.produce.backend(), "mem");
    }

    #[tokio::test]
    async fn test_build_kafka_handlers_without_brokers_fails() {
        let mut config = BackendConfig {
            kind: BackendKind::Kafka,
            ..Default::default()
        };
        config.kafka.brokers.clear();

        let result = build_handlers(&config, Arc::new(UuidIdSource)).await;
        assert!(matches!(result, Err(BackendError::ConfigurationError(_))));
    }
}

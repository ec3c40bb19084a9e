//! Streaming bridge between client sessions and ack-based brokers.
//!
//! A consume session forwards broker deliveries to the client and
//! acknowledges each one to the broker only after the client confirmed its
//! exact identifier, in delivery order, with at most `max_inflight`
//! unacknowledged messages outstanding. A produce session publishes client
//! messages one at a time and confirms each after the broker accepted it.
//!
//! ```text
//!   broker ──deliver──▶ delivery task ──Message──────▶ client
//!                            │ reserve/commit
//!                            ▼
//!                     in-flight window (FIFO, cap N)
//!                            │ pop
//!                            ▼
//!   broker ◀───ack──── ack task ◀──────Confirmation── client
//! ```
//!
//! Sessions end by returning an error value: [`SessionError::Cancelled`]
//! when the caller stopped them, any other variant when something broke, and
//! `Ok(())` when the client closed its inbound stream.

mod consume;
mod error;
mod produce;
mod window;

pub use consume::{run_consume, AckConsumeHandler, ConsumeSettings};
pub use error::{CloseErrors, SessionError, SessionResult};
pub use produce::{run_produce, AckProduceHandler};
pub use window::{in_flight_window, InFlight, Slot, WindowReceiver, WindowSender};

pub(crate) use error::conclude;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One payload unit with the identifier used to correlate its confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub data: Vec<u8>,
    pub id: String,
}

/// Acknowledgement of a [`Message`], by identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub msg_id: String,
}

impl Confirmation {
    pub fn new(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
        }
    }
}

/// Where a new subscription starts reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Offset {
    /// Backend default, which is the oldest retained message
    #[default]
    Default,
    Oldest,
    Newest,
}

/// Parameters of one consume session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub consumer: String,
    pub topic: String,
    pub offset: Offset,
}

impl ConsumerConfig {
    pub fn new(consumer: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            topic: topic.into(),
            offset: Offset::Default,
        }
    }

    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = offset;
        self
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.consumer.trim().is_empty() {
            return Err(SessionError::Configuration("consumer is required".to_string()));
        }
        if self.topic.trim().is_empty() {
            return Err(SessionError::Configuration("topic is required".to_string()));
        }
        Ok(())
    }
}

/// Parameters of one produce session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub topic: String,
}

impl ProducerConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self { topic: topic.into() }
    }

    pub fn validate(&self) -> SessionResult<()> {
        if self.topic.trim().is_empty() {
            return Err(SessionError::Configuration("topic is required".to_string()));
        }
        Ok(())
    }
}

/// Runs consume sessions for one backend
#[async_trait]
pub trait ConsumeHandler: Send + Sync {
    /// Backend label for logs and metrics
    fn backend(&self) -> &'static str;

    /// Drive one consume session until cancellation, client close, or failure
    async fn handle_consume(
        &self,
        cancel: CancellationToken,
        conf: ConsumerConfig,
        for_client: mpsc::Sender<Message>,
        confirmations: mpsc::Receiver<Confirmation>,
    ) -> SessionResult<()>;
}

/// Runs produce sessions for one backend
#[async_trait]
pub trait ProduceHandler: Send + Sync {
    /// Backend label for logs and metrics
    fn backend(&self) -> &'static str;

    /// Drive one produce session until cancellation, client close, or failure
    async fn handle_produce(
        &self,
        cancel: CancellationToken,
        conf: ProducerConfig,
        for_client: mpsc::Sender<Confirmation>,
        messages: mpsc::Receiver<Message>,
    ) -> SessionResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_validation() {
        assert!(ConsumerConfig::new("group", "orders").validate().is_ok());
        assert!(matches!(
            ConsumerConfig::new("", "orders").validate(),
            Err(SessionError::Configuration(_))
        ));
        assert!(matches!(
            ConsumerConfig::new("group", " ").validate(),
            Err(SessionError::Configuration(_))
        ));
    }

    #[test]
    fn test_producer_config_validation() {
        assert!(ProducerConfig::new("orders").validate().is_ok());
        assert!(ProducerConfig::new("").validate().is_err());
    }

    #[test]
    fn test_offset_default() {
        assert_eq!(Offset::default(), Offset::Default);
        assert_eq!(
            ConsumerConfig::new("g", "t").with_offset(Offset::Newest).offset,
            Offset::Newest
        );
    }
}

//! Source and sink factories for brokers whose clients already speak
//! confirm-then-commit.

use crate::backend::error::BackendResult;
use crate::session::{
    conclude, CloseErrors, Confirmation, ConsumeHandler, ConsumerConfig, Message, ProduceHandler, ProducerConfig,
    SessionError, SessionResult,
};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A consume source bound to one consumer config
#[async_trait]
pub trait AsyncMessageSource: Send {
    /// Stream messages to the client and commit each confirmed one.
    ///
    /// Same outcome contract as [`ConsumeHandler::handle_consume`].
    async fn consume_messages(
        &mut self,
        cancel: CancellationToken,
        for_client: mpsc::Sender<Message>,
        confirmations: mpsc::Receiver<Confirmation>,
    ) -> SessionResult<()>;

    async fn close(&mut self) -> BackendResult<()>;
}

/// A produce sink bound to one producer config
#[async_trait]
pub trait AsyncMessageSink: Send {
    /// Publish client messages and confirm each once the broker took it.
    ///
    /// Same outcome contract as [`ProduceHandler::handle_produce`].
    async fn publish_messages(
        &mut self,
        cancel: CancellationToken,
        for_client: mpsc::Sender<Confirmation>,
        messages: mpsc::Receiver<Message>,
    ) -> SessionResult<()>;

    async fn close(&mut self) -> BackendResult<()>;
}

#[async_trait]
pub trait AsyncSourceFactory: Send + Sync {
    fn name(&self) -> &'static str;

    async fn new_async_source(&self, conf: &ConsumerConfig) -> BackendResult<Box<dyn AsyncMessageSource>>;
}

#[async_trait]
pub trait AsyncSinkFactory: Send + Sync {
    fn name(&self) -> &'static str;

    async fn new_async_sink(&self, conf: &ProducerConfig) -> BackendResult<Box<dyn AsyncMessageSink>>;
}

/// [`ConsumeHandler`] building a fresh source per session
pub struct SourceConsumeHandler<F> {
    factory: F,
}

impl<F: AsyncSourceFactory> SourceConsumeHandler<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<F: AsyncSourceFactory> ConsumeHandler for SourceConsumeHandler<F> {
    fn backend(&self) -> &'static str {
        self.factory.name()
    }

    async fn handle_consume(
        &self,
        cancel: CancellationToken,
        conf: ConsumerConfig,
        for_client: mpsc::Sender<Message>,
        confirmations: mpsc::Receiver<Confirmation>,
    ) -> SessionResult<()> {
        conf.validate()?;
        let backend = self.factory.name();
        let mut source = self
            .factory
            .new_async_source(&conf)
            .await
            .map_err(SessionError::Connection)?;

        info!(backend, topic = %conf.topic, consumer = %conf.consumer, "Consume session started");
        let outcome = source.consume_messages(cancel, for_client, confirmations).await;
        let closed: CloseErrors = std::iter::once(source.close().await).collect();
        let result = conclude(outcome, closed.into_result());
        log_outcome("consume", backend, &conf.topic, &result);
        result
    }
}

/// [`ProduceHandler`] building a fresh sink per session
pub struct SinkProduceHandler<F> {
    factory: F,
}

impl<F: AsyncSinkFactory> SinkProduceHandler<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<F: AsyncSinkFactory> ProduceHandler for SinkProduceHandler<F> {
    fn backend(&self) -> &'static str {
        self.factory.name()
    }

    async fn handle_produce(
        &self,
        cancel: CancellationToken,
        conf: ProducerConfig,
        for_client: mpsc::Sender<Confirmation>,
        messages: mpsc::Receiver<Message>,
    ) -> SessionResult<()> {
        conf.validate()?;
        let backend = self.factory.name();
        let mut sink = self
            .factory
            .new_async_sink(&conf)
            .await
            .map_err(SessionError::Connection)?;

        info!(backend, topic = %conf.topic, "Produce session started");
        let outcome = sink.publish_messages(cancel, for_client, messages).await;
        let closed: CloseErrors = std::iter::once(sink.close().await).collect();
        let result = conclude(outcome, closed.into_result());
        log_outcome("produce", backend, &conf.topic, &result);
        result
    }
}

fn log_outcome(kind: &str, backend: &str, topic: &str, result: &SessionResult<()>) {
    match result {
        Ok(()) => info!(kind, backend, topic, "Session ended by client"),
        Err(err) if err.is_cancelled() => debug!(kind, backend, topic, "Session cancelled"),
        Err(err) => warn!(kind, backend, topic, error = %err, "Session failed"),
    }
}

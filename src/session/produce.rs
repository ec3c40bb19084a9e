//! Produce bridge

use crate::backend::{AckBroker, BackendError, BrokerConnection, IdSource};
use crate::metrics::GATEWAY_METRICS;
use crate::session::{
    conclude, CloseErrors, Confirmation, Message, ProduceHandler, ProducerConfig, SessionError,
    SessionResult,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// [`ProduceHandler`] running [`run_produce`] against one ack-based broker
pub struct AckProduceHandler {
    broker: Arc<dyn AckBroker>,
    ids: Arc<dyn IdSource>,
}

impl AckProduceHandler {
    pub fn new(broker: Arc<dyn AckBroker>, ids: Arc<dyn IdSource>) -> Self {
        Self { broker, ids }
    }
}

#[async_trait]
impl ProduceHandler for AckProduceHandler {
    fn backend(&self) -> &'static str {
        self.broker.name()
    }

    async fn handle_produce(
        &self,
        cancel: CancellationToken,
        conf: ProducerConfig,
        for_client: mpsc::Sender<Confirmation>,
        messages: mpsc::Receiver<Message>,
    ) -> SessionResult<()> {
        run_produce(
            self.broker.as_ref(),
            self.ids.as_ref(),
            cancel,
            conf,
            for_client,
            messages,
        )
        .await
    }
}

/// Drive one produce session.
///
/// Each message read from `messages` is published synchronously and confirmed
/// on `for_client` with its original identifier before the next one is read.
/// A failed publish ends the session; there is no retry.
pub async fn run_produce(
    broker: &dyn AckBroker,
    ids: &dyn IdSource,
    cancel: CancellationToken,
    conf: ProducerConfig,
    for_client: mpsc::Sender<Confirmation>,
    mut messages: mpsc::Receiver<Message>,
) -> SessionResult<()> {
    conf.validate()?;

    let backend = broker.name();
    let connection = broker
        .connect(&ids.next_id())
        .await
        .map_err(SessionError::Connection)?;

    info!(backend, topic = %conf.topic, "Produce session started");

    let outcome = publish_loop(
        connection.as_ref(),
        &cancel,
        &conf,
        &for_client,
        &mut messages,
        backend,
    )
    .await;

    let closed: CloseErrors = std::iter::once(connection.close().await).collect();
    let result = conclude(outcome, closed.into_result());
    match &result {
        Ok(()) => info!(backend, topic = %conf.topic, "Produce session ended by client"),
        Err(err) if err.is_cancelled() => debug!(backend, topic = %conf.topic, "Produce session cancelled"),
        Err(err) => warn!(backend, topic = %conf.topic, error = %err, "Produce session failed"),
    }
    result
}

async fn publish_loop(
    connection: &dyn BrokerConnection,
    cancel: &CancellationToken,
    conf: &ProducerConfig,
    for_client: &mpsc::Sender<Confirmation>,
    messages: &mut mpsc::Receiver<Message>,
    backend: &'static str,
) -> SessionResult<()> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = connection.disconnected() => return Err(SessionError::Backend(BackendError::Disconnected)),
            message = messages.recv() => match message {
                Some(message) => message,
                None => return Ok(()),
            },
        };

        let Message { data, id } = message;
        let started = Instant::now();
        let size = data.len();

        // A publish is one unit: it is not abandoned on cancellation, only
        // when the broker link goes away underneath it.
        tokio::select! {
            _ = connection.disconnected() => return Err(SessionError::Backend(BackendError::Disconnected)),
            published = connection.publish(&conf.topic, data) => {
                if let Err(err) = published {
                    GATEWAY_METRICS
                        .publish_failures
                        .with_label_values(&[backend])
                        .inc();
                    return Err(SessionError::Backend(err));
                }
            }
        }

        GATEWAY_METRICS
            .messages_published
            .with_label_values(&[backend])
            .inc();
        GATEWAY_METRICS
            .publish_latency
            .with_label_values(&[backend])
            .observe(started.elapsed().as_secs_f64());
        debug!(backend, topic = %conf.topic, msg_id = %id, size, "Published message");

        tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            sent = for_client.send(Confirmation { msg_id: id }) => {
                if sent.is_err() {
                    debug!(backend, "Client stopped receiving confirmations");
                    return Ok(());
                }
            }
        }
    }
}

//! Consume bridge

use crate::backend::{AckBroker, BackendError, Delivery, IdSource, SubscribeOptions, Subscription};
use crate::metrics::GATEWAY_METRICS;
use crate::session::window::{in_flight_window, WindowReceiver, WindowSender};
use crate::session::{
    conclude, CloseErrors, Confirmation, ConsumeHandler, ConsumerConfig, Message, SessionError,
    SessionResult,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Flow-control settings applied to every consume session of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeSettings {
    pub max_inflight: usize,
    pub ack_wait: Duration,
}

impl ConsumeSettings {
    pub fn new(max_inflight: usize, ack_wait: Duration) -> Self {
        Self {
            max_inflight,
            ack_wait,
        }
    }
}

impl Default for ConsumeSettings {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

/// [`ConsumeHandler`] running [`run_consume`] against one ack-based broker
pub struct AckConsumeHandler {
    broker: Arc<dyn AckBroker>,
    ids: Arc<dyn IdSource>,
    settings: ConsumeSettings,
}

impl AckConsumeHandler {
    pub fn new(broker: Arc<dyn AckBroker>, ids: Arc<dyn IdSource>, settings: ConsumeSettings) -> Self {
        Self {
            broker,
            ids,
            settings,
        }
    }
}

#[async_trait]
impl ConsumeHandler for AckConsumeHandler {
    fn backend(&self) -> &'static str {
        self.broker.name()
    }

    async fn handle_consume(
        &self,
        cancel: CancellationToken,
        conf: ConsumerConfig,
        for_client: mpsc::Sender<Message>,
        confirmations: mpsc::Receiver<Confirmation>,
    ) -> SessionResult<()> {
        run_consume(
            self.broker.as_ref(),
            self.ids.as_ref(),
            self.settings,
            cancel,
            conf,
            for_client,
            confirmations,
        )
        .await
    }
}

/// Drive one consume session.
///
/// Deliveries are written to `for_client`; each is acknowledged to the broker
/// only after the next item on `confirmations` names its exact sequence. At
/// most `settings.max_inflight` messages are unacknowledged at any time.
///
/// Returns [`SessionError::Cancelled`] when `cancel` fires, `Ok(())` when the
/// client stops receiving or closes `confirmations`, and the first failure
/// otherwise. Broker resources are always released before returning.
pub async fn run_consume(
    broker: &dyn AckBroker,
    ids: &dyn IdSource,
    settings: ConsumeSettings,
    cancel: CancellationToken,
    conf: ConsumerConfig,
    for_client: mpsc::Sender<Message>,
    confirmations: mpsc::Receiver<Confirmation>,
) -> SessionResult<()> {
    conf.validate()?;
    let (window_tx, window_rx) = in_flight_window::<Box<dyn Delivery>>(settings.max_inflight)?;

    let backend = broker.name();
    let client_id = format!("{}-{}", conf.consumer, ids.next_id());
    let connection = broker
        .connect(&client_id)
        .await
        .map_err(SessionError::Connection)?;

    let options = SubscribeOptions {
        topic: conf.topic.clone(),
        group: conf.consumer.clone(),
        start: conf.offset,
        ack_wait: settings.ack_wait,
        max_inflight: settings.max_inflight,
    };
    let subscription = match connection.queue_subscribe(options).await {
        Ok(subscription) => subscription,
        Err(err) => {
            let closed: CloseErrors = std::iter::once(connection.close().await).collect();
            return conclude(Err(SessionError::Connection(err)), closed.into_result());
        }
    };

    info!(
        backend,
        topic = %conf.topic,
        consumer = %conf.consumer,
        client_id = %client_id,
        max_inflight = settings.max_inflight,
        "Consume session started"
    );

    let session = cancel.child_token();
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<SessionResult<()>>(2);

    let ack_task = {
        let session = session.clone();
        let outcome_tx = outcome_tx.clone();
        tokio::spawn(async move {
            let result = run_ack_loop(&session, window_rx, confirmations, backend).await;
            let _ = outcome_tx.send(result).await;
        })
    };

    let delivery_task = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut subscription = subscription;
            let result =
                run_delivery_loop(&session, subscription.as_mut(), &window_tx, &for_client, backend).await;
            let _ = outcome_tx.send(result).await;
            subscription
        })
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        outcome = outcome_rx.recv() => outcome.unwrap_or_else(|| {
            Err(SessionError::Task("consume tasks exited without an outcome".to_string()))
        }),
        _ = connection.disconnected() => Err(SessionError::Backend(BackendError::Disconnected)),
    };

    // Stop both tasks at their next wait point. An acknowledgement already
    // sent to the broker is allowed to complete first.
    session.cancel();

    let mut closed = CloseErrors::new();
    if let Err(err) = ack_task.await {
        error!(backend, error = %err, "Acknowledgement task failed");
    }
    match delivery_task.await {
        Ok(mut subscription) => closed.record(subscription.close().await),
        Err(err) => closed.record(Err(BackendError::CloseFailed(format!(
            "subscription lost with delivery task: {}",
            err
        )))),
    }
    closed.record(connection.close().await);

    let result = conclude(outcome, closed.into_result());
    match &result {
        Ok(()) => info!(backend, topic = %conf.topic, consumer = %conf.consumer, "Consume session ended by client"),
        Err(err) if err.is_cancelled() => {
            debug!(backend, topic = %conf.topic, consumer = %conf.consumer, "Consume session cancelled")
        }
        Err(err) => warn!(
            backend,
            topic = %conf.topic,
            consumer = %conf.consumer,
            error = %err,
            "Consume session failed"
        ),
    }
    result
}

/// Forward deliveries to the client, then park them in the window.
async fn run_delivery_loop(
    session: &CancellationToken,
    subscription: &mut dyn Subscription,
    window: &WindowSender<Box<dyn Delivery>>,
    for_client: &mpsc::Sender<Message>,
    backend: &'static str,
) -> SessionResult<()> {
    loop {
        let delivery = tokio::select! {
            _ = session.cancelled() => return Err(SessionError::Cancelled),
            next = subscription.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => return Err(SessionError::Backend(err)),
                None => {
                    return Err(SessionError::Backend(BackendError::ConsumeFailed(
                        "subscription closed by broker".to_string(),
                    )))
                }
            },
        };

        // A delivery dropped here stays unacknowledged and is redelivered by
        // the broker after its ack wait.
        let slot = tokio::select! {
            _ = session.cancelled() => return Err(SessionError::Cancelled),
            slot = window.reserve() => slot,
        };

        let message = Message {
            data: delivery.payload().to_vec(),
            id: delivery.sequence().to_string(),
        };
        tokio::select! {
            _ = session.cancelled() => return Err(SessionError::Cancelled),
            sent = for_client.send(message) => {
                if sent.is_err() {
                    debug!(backend, "Client stopped receiving messages");
                    return Ok(());
                }
            }
        }

        GATEWAY_METRICS
            .messages_delivered
            .with_label_values(&[backend])
            .inc();

        if !slot.commit(delivery) {
            return Ok(());
        }
    }
}

/// Match each confirmation against the oldest outstanding delivery and ack it.
async fn run_ack_loop(
    session: &CancellationToken,
    mut window: WindowReceiver<Box<dyn Delivery>>,
    mut confirmations: mpsc::Receiver<Confirmation>,
    backend: &'static str,
) -> SessionResult<()> {
    loop {
        // A confirmation may overtake the commit of the message it names, so
        // one read while a slot is reserved is held until the entry lands.
        // Room is reserved before the client sees a message, so an empty
        // window means nothing is awaiting confirmation.
        let mut early = None;
        let entry = tokio::select! {
            _ = session.cancelled() => return Err(SessionError::Cancelled),
            entry = window.pop() => entry,
            confirmation = confirmations.recv() => match confirmation {
                Some(confirmation) => {
                    if window.is_empty() {
                        warn!(backend, msg_id = %confirmation.msg_id, "Unsolicited confirmation");
                        return Err(SessionError::UnsolicitedConfirmation(confirmation.msg_id));
                    }
                    early = Some(confirmation);
                    tokio::select! {
                        _ = session.cancelled() => return Err(SessionError::Cancelled),
                        entry = window.pop() => entry,
                    }
                }
                None => return Ok(()),
            },
        };
        let Some(entry) = entry else {
            return Ok(());
        };

        let confirmation = match early {
            Some(confirmation) => confirmation,
            None => tokio::select! {
                _ = session.cancelled() => return Err(SessionError::Cancelled),
                confirmation = confirmations.recv() => match confirmation {
                    Some(confirmation) => confirmation,
                    None => return Ok(()),
                },
            },
        };

        let expected = entry.sequence();
        let sequence = match parse_sequence(&confirmation.msg_id) {
            Some(sequence) => sequence,
            None => {
                warn!(backend, msg_id = %confirmation.msg_id, "Unparseable confirmation");
                return Err(SessionError::UnparseableSequence(confirmation.msg_id));
            }
        };
        if sequence != expected {
            warn!(backend, got = sequence, want = expected, "Confirmation out of order");
            return Err(SessionError::UnexpectedSequence {
                got: sequence.to_string(),
                want: expected.to_string(),
            });
        }

        entry.ack().await.map_err(SessionError::Backend)?;

        GATEWAY_METRICS
            .messages_confirmed
            .with_label_values(&[backend])
            .inc();
    }
}

/// Parse a decimal broker sequence; signs, whitespace and empty strings are rejected
fn parse_sequence(id: &str) -> Option<u64> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence("5"), Some(5));
        assert_eq!(parse_sequence("18446744073709551615"), Some(u64::MAX));
        assert_eq!(parse_sequence("18446744073709551616"), None);
        assert_eq!(parse_sequence("+5"), None);
        assert_eq!(parse_sequence(" 5"), None);
        assert_eq!(parse_sequence(""), None);
        assert_eq!(parse_sequence("abc"), None);
    }

    #[test]
    fn test_default_settings() {
        let settings = ConsumeSettings::default();
        assert_eq!(settings.max_inflight, 10);
        assert_eq!(settings.ack_wait, Duration::from_secs(60));
    }
}

mod common;

use async_trait::async_trait;
use common::{eventually, settings, spawn_consume, GROUP, TOPIC};
use proximo_gateway::backend::{
    AckBroker, BackendError, BackendResult, BrokerConnection, Delivery, MemoryBroker, SubscribeOptions,
    Subscription,
};
use proximo_gateway::session::{ConsumeSettings, ConsumerConfig, Offset, SessionError};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Delivers an endless run of messages, ignoring any broker-side in-flight cap
#[derive(Clone, Default)]
struct FloodBroker {
    pulled: Arc<AtomicU64>,
    acks: Arc<AtomicUsize>,
}

struct FloodConnection {
    broker: FloodBroker,
}

struct FloodSubscription {
    broker: FloodBroker,
}

struct FloodDelivery {
    sequence: u64,
    acks: Arc<AtomicUsize>,
}

#[async_trait]
impl AckBroker for FloodBroker {
    fn name(&self) -> &'static str {
        "flood"
    }

    async fn connect(&self, _client_id: &str) -> BackendResult<Box<dyn BrokerConnection>> {
        Ok(Box::new(FloodConnection { broker: self.clone() }))
    }
}

#[async_trait]
impl BrokerConnection for FloodConnection {
    async fn queue_subscribe(&self, _options: SubscribeOptions) -> BackendResult<Box<dyn Subscription>> {
        Ok(Box::new(FloodSubscription {
            broker: self.broker.clone(),
        }))
    }

    async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> BackendResult<()> {
        Ok(())
    }

    async fn disconnected(&self) {
        std::future::pending::<()>().await
    }

    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Subscription for FloodSubscription {
    async fn next(&mut self) -> Option<BackendResult<Box<dyn Delivery>>> {
        let sequence = self.broker.pulled.fetch_add(1, Ordering::SeqCst) + 1;
        Some(Ok(Box::new(FloodDelivery {
            sequence,
            acks: self.broker.acks.clone(),
        })))
    }

    async fn close(&mut self) -> BackendResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Delivery for FloodDelivery {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn payload(&self) -> &[u8] {
        b"flood"
    }

    async fn ack(&self) -> BackendResult<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn seed(broker: &MemoryBroker, count: usize) {
    for i in 1..=count {
        broker.publish(TOPIC, format!("payload-{}", i));
    }
}

fn conf() -> ConsumerConfig {
    ConsumerConfig::new(GROUP, TOPIC)
}

/// Messages arrive in broker order and are acked in confirmation order
#[tokio::test]
async fn test_delivers_and_acks_in_order() {
    let broker = MemoryBroker::new();
    seed(&broker, 5);

    let mut client = spawn_consume(&broker, settings(10), conf());
    for expected in 1..=5u64 {
        let msg = client.recv().await;
        assert_eq!(msg.id, expected.to_string());
        assert_eq!(msg.data, format!("payload-{}", expected).into_bytes());
        client.confirm(&msg.id).await;
    }

    eventually(|| broker.acked(TOPIC, GROUP).len() == 5).await;
    assert_eq!(broker.acked(TOPIC, GROUP), vec![1, 2, 3, 4, 5]);

    client.cancel.cancel();
    let result = client.finish().await;
    assert!(matches!(result, Err(SessionError::Cancelled)));
}

/// No more than max_inflight messages are ever outstanding
#[tokio::test]
async fn test_inflight_window_bounds_delivery() {
    let broker = MemoryBroker::new();
    seed(&broker, 10);

    let mut client = spawn_consume(&broker, settings(3), conf());
    let first = client.recv().await;
    client.recv().await;
    client.recv().await;

    let blocked = tokio::time::timeout(Duration::from_millis(100), client.messages.recv()).await;
    assert!(blocked.is_err(), "fourth message delivered before any confirmation");
    assert!(broker.pending(TOPIC, GROUP) <= 3);

    client.confirm(&first.id).await;
    let fourth = client.recv().await;
    assert_eq!(fourth.id, "4");

    client.cancel.cancel();
    client.finish().await.unwrap_err();
}

/// The session holds back deliveries on its own when the broker does not
#[tokio::test]
async fn test_window_bounds_unthrottled_broker() {
    let broker = FloodBroker::default();

    let mut client = spawn_consume(&broker, settings(3), conf());
    for expected in 1..=3u64 {
        assert_eq!(client.recv().await.id, expected.to_string());
    }

    let blocked = tokio::time::timeout(Duration::from_millis(100), client.messages.recv()).await;
    assert!(blocked.is_err(), "fourth message delivered before any confirmation");

    client.confirm("1").await;
    assert_eq!(client.recv().await.id, "4");
    let blocked = tokio::time::timeout(Duration::from_millis(100), client.messages.recv()).await;
    assert!(blocked.is_err(), "fifth message delivered with three outstanding");
    assert_eq!(broker.acks.load(Ordering::SeqCst), 1);

    client.cancel.cancel();
    client.finish().await.unwrap_err();
}

/// A confirmation naming the wrong sequence ends the session without an ack
#[tokio::test]
async fn test_out_of_order_confirmation_is_rejected() {
    let broker = MemoryBroker::new();
    seed(&broker, 5);

    let mut client = spawn_consume(&broker, settings(10), conf());
    for _ in 1..=4 {
        let msg = client.recv().await;
        client.confirm(&msg.id).await;
    }
    let fifth = client.recv().await;
    assert_eq!(fifth.id, "5");
    eventually(|| broker.acked(TOPIC, GROUP).len() == 4).await;

    client.confirm("6").await;
    let err = client.finish().await.unwrap_err();
    assert!(err.is_protocol_violation());
    match err {
        SessionError::UnexpectedSequence { got, want } => {
            assert_eq!(got, "6");
            assert_eq!(want, "5");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broker.acked(TOPIC, GROUP), vec![1, 2, 3, 4]);
}

/// Confirming again after the only message was acked is a violation
#[tokio::test]
async fn test_repeated_confirmation_is_rejected() {
    let broker = MemoryBroker::new();
    seed(&broker, 1);

    let mut client = spawn_consume(&broker, settings(10), conf());
    let msg = client.recv().await;
    client.confirm(&msg.id).await;
    eventually(|| broker.acked(TOPIC, GROUP) == vec![1]).await;

    client.confirm(&msg.id).await;
    let err = client.finish().await.unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(matches!(err, SessionError::UnsolicitedConfirmation(ref id) if id == "1"));
    assert_eq!(broker.acked(TOPIC, GROUP), vec![1]);
}

#[tokio::test]
async fn test_non_numeric_confirmation_is_rejected() {
    let broker = MemoryBroker::new();
    seed(&broker, 1);

    let mut client = spawn_consume(&broker, settings(10), conf());
    client.recv().await;
    client.confirm("abc").await;

    let err = client.finish().await.unwrap_err();
    assert!(matches!(err, SessionError::UnparseableSequence(ref id) if id == "abc"));
    assert!(broker.acked(TOPIC, GROUP).is_empty());
}

/// Cancellation releases every broker resource and both client channels
#[tokio::test]
async fn test_cancellation_releases_resources() {
    let broker = MemoryBroker::new();
    seed(&broker, 3);

    let mut client = spawn_consume(&broker, settings(10), conf());
    client.recv().await;
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(broker.open_subscriptions(), 1);

    client.cancel.cancel();
    let confirmations = client.confirmations.clone();
    let session = client.session;
    let result = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(SessionError::Cancelled)));

    // Drain anything forwarded before the cancel; the channel must then close.
    while client.messages.recv().await.is_some() {}
    assert!(confirmations.is_closed());
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_subscriptions(), 0);
    assert!(broker.acked(TOPIC, GROUP).is_empty());
}

/// Closing the confirmation stream ends the session cleanly
#[tokio::test]
async fn test_client_close_ends_cleanly() {
    let broker = MemoryBroker::new();
    seed(&broker, 2);

    let mut client = spawn_consume(&broker, settings(10), conf());
    let msg = client.recv().await;
    client.confirm(&msg.id).await;
    eventually(|| broker.acked(TOPIC, GROUP) == vec![1]).await;

    let common::ConsumeClient {
        confirmations,
        messages,
        session,
        ..
    } = client;
    drop(confirmations);

    let result = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    drop(messages);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_zero_window_rejected_before_connecting() {
    let broker = MemoryBroker::new();

    let client = spawn_consume(&broker, settings(0), conf());
    let err = client.finish().await.unwrap_err();
    assert!(matches!(err, SessionError::Configuration(_)));
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_empty_consumer_rejected() {
    let broker = MemoryBroker::new();

    let client = spawn_consume(&broker, settings(10), ConsumerConfig::new("", TOPIC));
    let err = client.finish().await.unwrap_err();
    assert!(matches!(err, SessionError::Configuration(_)));
}

#[tokio::test]
async fn test_unreachable_broker_fails_to_connect() {
    let broker = MemoryBroker::new();
    broker.sever();

    let client = spawn_consume(&broker, settings(10), conf());
    let err = client.finish().await.unwrap_err();
    assert!(matches!(err, SessionError::Connection(BackendError::ConnectionFailed(_))));
}

/// Losing the broker mid-stream fails the session instead of hanging it
#[tokio::test]
async fn test_broker_loss_fails_session() {
    let broker = MemoryBroker::new();
    seed(&broker, 1000);

    let mut client = spawn_consume(&broker, settings(10), conf());
    for _ in 0..10 {
        let msg = client.recv().await;
        client.confirm(&msg.id).await;
    }
    broker.sever();

    let err = client.finish().await.unwrap_err();
    assert!(!err.is_cancelled());
    assert_eq!(err.kind(), "backend");
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_subscriptions(), 0);
}

/// Close failures of every resource are reported along with the cause
#[tokio::test]
async fn test_close_failures_are_aggregated() {
    let broker = MemoryBroker::new();
    seed(&broker, 1);
    broker.fail_closes(true);

    let mut client = spawn_consume(&broker, settings(10), conf());
    client.recv().await;
    client.cancel.cancel();

    match client.finish().await.unwrap_err() {
        SessionError::Release { cause, close } => {
            assert!(cause.is_cancelled());
            assert_eq!(close.errors().len(), 2);
            assert!(close.to_string().starts_with("2 errors occurred:"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Unconfirmed messages come back to the group after the ack wait
#[tokio::test(start_paused = true)]
async fn test_unconfirmed_message_is_redelivered() {
    let broker = MemoryBroker::new();
    seed(&broker, 1);
    let quick = ConsumeSettings::new(10, Duration::from_secs(2));

    let mut first = spawn_consume(&broker, quick, conf());
    assert_eq!(first.recv().await.id, "1");
    first.cancel.cancel();
    first.finish().await.unwrap_err();

    let mut second = spawn_consume(&broker, quick, conf());
    let again = second.recv().await;
    assert_eq!(again.id, "1");
    second.confirm(&again.id).await;

    eventually(|| broker.acked(TOPIC, GROUP) == vec![1]).await;
    second.cancel.cancel();
    second.finish().await.unwrap_err();
}

#[tokio::test]
async fn test_newest_offset_skips_backlog() {
    let broker = MemoryBroker::new();
    seed(&broker, 3);

    let mut client = spawn_consume(&broker, settings(10), conf().with_offset(Offset::Newest));
    eventually(|| broker.open_subscriptions() == 1).await;
    broker.publish(TOPIC, "fresh");

    let msg = client.recv().await;
    assert_eq!(msg.id, "4");
    assert_eq!(msg.data, b"fresh");

    client.cancel.cancel();
    client.finish().await.unwrap_err();
}

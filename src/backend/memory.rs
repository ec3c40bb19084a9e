//! In-process durable broker.
//!
//! Topics are append-only logs with 1-based sequences. Each `(topic, group)`
//! pair is a durable queue group: its delivery cursor and unacknowledged set
//! survive subscriptions coming and going, so a reconnecting consumer picks up
//! redeliveries. Unacknowledged messages are redelivered once their ack wait
//! expires, and at most `max_inflight` are outstanding per group.
//!
//! The broker link can be severed and restored, which fails every broker
//! operation and fires [`BrokerConnection::disconnected`] in between.

use crate::backend::error::{BackendError, BackendResult};
use crate::backend::{AckBroker, BrokerConnection, Delivery, SubscribeOptions, Subscription};
use crate::session::Offset;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// One acknowledgement as the broker saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub topic: String,
    pub group: String,
    pub sequence: u64,
}

#[derive(Debug)]
struct GroupState {
    /// Next never-delivered sequence
    next: u64,
    /// Unacknowledged sequences and their redelivery deadlines
    pending: BTreeMap<u64, Instant>,
    ack_wait: Duration,
    max_inflight: usize,
}

enum NextDelivery {
    Ready(u64, Vec<u8>),
    Wait(Option<Instant>),
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<u8>>>,
    groups: HashMap<(String, String), GroupState>,
    acks: Vec<AckRecord>,
    open_connections: usize,
    open_subscriptions: usize,
    fail_closes: bool,
}

impl BrokerState {
    fn append(&mut self, topic: &str, payload: Vec<u8>) -> u64 {
        let log = self.topics.entry(topic.to_string()).or_default();
        log.push(payload);
        log.len() as u64
    }

    fn next_delivery(&mut self, topic: &str, group: &str, now: Instant) -> NextDelivery {
        let log = self.topics.get(topic);
        let log_len = log.map_or(0, |l| l.len() as u64);
        let Some(state) = self.groups.get_mut(&(topic.to_string(), group.to_string())) else {
            return NextDelivery::Wait(None);
        };

        let expired = state
            .pending
            .iter()
            .find(|(_, deadline)| **deadline <= now)
            .map(|(seq, _)| *seq);

        let sequence = match expired {
            Some(seq) => Some(seq),
            None if state.pending.len() < state.max_inflight && state.next <= log_len => {
                let seq = state.next;
                state.next += 1;
                Some(seq)
            }
            None => None,
        };

        match (sequence, log) {
            (Some(seq), Some(log)) => {
                state.pending.insert(seq, now + state.ack_wait);
                NextDelivery::Ready(seq, log[(seq - 1) as usize].clone())
            }
            _ => NextDelivery::Wait(state.pending.values().min().copied()),
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    /// Bumped on every change a waiting subscription may care about
    epoch: watch::Sender<u64>,
    /// True while the broker link is up
    link: watch::Sender<bool>,
}

impl Shared {
    fn bump(&self) {
        self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    fn link_up(&self) -> bool {
        *self.link.borrow()
    }
}

/// In-memory ack-based broker
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        let (link, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                epoch,
                link,
            }),
        }
    }

    /// Append a message directly, bypassing any session. Returns its sequence.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> u64 {
        let sequence = self.shared.state.lock().append(topic, payload.into());
        self.shared.bump();
        sequence
    }

    /// Cut the link: broker operations fail and connections report disconnect
    pub fn sever(&self) {
        self.shared.link.send_replace(false);
        self.shared.bump();
    }

    pub fn restore(&self) {
        self.shared.link.send_replace(true);
        self.shared.bump();
    }

    /// Make every subscription and connection close fail
    pub fn fail_closes(&self, fail: bool) {
        self.shared.state.lock().fail_closes = fail;
    }

    /// Every acknowledgement received, in arrival order
    pub fn acks(&self) -> Vec<AckRecord> {
        self.shared.state.lock().acks.clone()
    }

    /// Sequences acknowledged for one group, in arrival order
    pub fn acked(&self, topic: &str, group: &str) -> Vec<u64> {
        self.shared
            .state
            .lock()
            .acks
            .iter()
            .filter(|ack| ack.topic == topic && ack.group == group)
            .map(|ack| ack.sequence)
            .collect()
    }

    /// Unacknowledged deliveries of one group
    pub fn pending(&self, topic: &str, group: &str) -> usize {
        self.shared
            .state
            .lock()
            .groups
            .get(&(topic.to_string(), group.to_string()))
            .map_or(0, |state| state.pending.len())
    }

    /// Payloads of a topic in sequence order
    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn open_connections(&self) -> usize {
        self.shared.state.lock().open_connections
    }

    pub fn open_subscriptions(&self) -> usize {
        self.shared.state.lock().open_subscriptions
    }
}

#[async_trait]
impl AckBroker for MemoryBroker {
    fn name(&self) -> &'static str {
        "mem"
    }

    async fn connect(&self, client_id: &str) -> BackendResult<Box<dyn BrokerConnection>> {
        if !self.shared.link_up() {
            return Err(BackendError::ConnectionFailed(format!(
                "broker unreachable for client {}",
                client_id
            )));
        }
        self.shared.state.lock().open_connections += 1;
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn queue_subscribe(&self, options: SubscribeOptions) -> BackendResult<Box<dyn Subscription>> {
        if !self.shared.link_up() {
            return Err(BackendError::SubscribeFailed("broker link lost".to_string()));
        }
        if options.max_inflight == 0 {
            return Err(BackendError::SubscribeFailed(
                "max_inflight must be at least 1".to_string(),
            ));
        }

        {
            let mut state = self.shared.state.lock();
            let log_len = state.topics.get(&options.topic).map_or(0, |l| l.len() as u64);
            let group = state
                .groups
                .entry((options.topic.clone(), options.group.clone()))
                .or_insert_with(|| GroupState {
                    next: match options.start {
                        Offset::Default | Offset::Oldest => 1,
                        Offset::Newest => log_len + 1,
                    },
                    pending: BTreeMap::new(),
                    ack_wait: options.ack_wait,
                    max_inflight: options.max_inflight,
                });
            group.ack_wait = options.ack_wait;
            group.max_inflight = options.max_inflight;
            state.open_subscriptions += 1;
        }

        Ok(Box::new(MemorySubscription {
            shared: self.shared.clone(),
            epoch: self.shared.epoch.subscribe(),
            topic: options.topic,
            group: options.group,
            closed: false,
        }))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BackendResult<()> {
        if !self.shared.link_up() {
            return Err(BackendError::PublishFailed("broker link lost".to_string()));
        }
        self.shared.state.lock().append(topic, payload);
        self.shared.bump();
        Ok(())
    }

    async fn disconnected(&self) {
        let mut link = self.shared.link.subscribe();
        let lost = link.wait_for(|up| !*up).await.is_ok();
        if !lost {
            // Sender gone: the link can no longer change.
            std::future::pending::<()>().await;
        }
    }

    async fn close(&self) -> BackendResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.shared.state.lock();
        state.open_connections -= 1;
        if state.fail_closes {
            return Err(BackendError::CloseFailed("connection close rejected".to_string()));
        }
        Ok(())
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    epoch: watch::Receiver<u64>,
    topic: String,
    group: String,
    closed: bool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<BackendResult<Box<dyn Delivery>>> {
        loop {
            self.epoch.borrow_and_update();
            if !self.shared.link_up() {
                return Some(Err(BackendError::Disconnected));
            }

            let next = self
                .shared
                .state
                .lock()
                .next_delivery(&self.topic, &self.group, Instant::now());

            let deadline = match next {
                NextDelivery::Ready(sequence, payload) => {
                    return Some(Ok(Box::new(MemoryDelivery {
                        shared: self.shared.clone(),
                        topic: self.topic.clone(),
                        group: self.group.clone(),
                        sequence,
                        payload,
                    })));
                }
                NextDelivery::Wait(deadline) => deadline,
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        changed = self.epoch.changed() => if changed.is_err() { return None; },
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    if self.epoch.changed().await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn close(&mut self) -> BackendResult<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        let mut state = self.shared.state.lock();
        state.open_subscriptions -= 1;
        if state.fail_closes {
            return Err(BackendError::CloseFailed("subscription close rejected".to_string()));
        }
        Ok(())
    }
}

struct MemoryDelivery {
    shared: Arc<Shared>,
    topic: String,
    group: String,
    sequence: u64,
    payload: Vec<u8>,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> BackendResult<()> {
        if !self.shared.link_up() {
            return Err(BackendError::AckFailed("broker link lost".to_string()));
        }
        {
            let mut state = self.shared.state.lock();
            if let Some(group) = state.groups.get_mut(&(self.topic.clone(), self.group.clone())) {
                group.pending.remove(&self.sequence);
            }
            state.acks.push(AckRecord {
                topic: self.topic.clone(),
                group: self.group.clone(),
                sequence: self.sequence,
            });
        }
        self.shared.bump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(topic: &str, group: &str, start: Offset, max_inflight: usize) -> SubscribeOptions {
        SubscribeOptions {
            topic: topic.to_string(),
            group: group.to_string(),
            start,
            ack_wait: Duration::from_secs(30),
            max_inflight,
        }
    }

    #[tokio::test]
    async fn test_delivers_in_sequence_order() {
        let broker = MemoryBroker::new();
        broker.publish("orders", "a");
        broker.publish("orders", "b");

        let conn = broker.connect("c1").await.unwrap();
        let mut sub = conn
            .queue_subscribe(options("orders", "g", Offset::Oldest, 10))
            .await
            .unwrap();

        let first = sub.next().await.unwrap().unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!((first.sequence(), first.payload()), (1, b"a".as_slice()));
        assert_eq!((second.sequence(), second.payload()), (2, b"b".as_slice()));

        first.ack().await.unwrap();
        assert_eq!(broker.acked("orders", "g"), vec![1]);
        assert_eq!(broker.pending("orders", "g"), 1);
    }

    #[tokio::test]
    async fn test_newest_skips_existing_messages() {
        let broker = MemoryBroker::new();
        broker.publish("orders", "old");

        let conn = broker.connect("c1").await.unwrap();
        let mut sub = conn
            .queue_subscribe(options("orders", "g", Offset::Newest, 10))
            .await
            .unwrap();
        broker.publish("orders", "new");

        let delivery = sub.next().await.unwrap().unwrap();
        assert_eq!(delivery.sequence(), 2);
        assert_eq!(delivery.payload(), b"new");
    }

    #[tokio::test]
    async fn test_broker_side_inflight_cap() {
        let broker = MemoryBroker::new();
        for i in 0..3 {
            broker.publish("orders", vec![i]);
        }

        let conn = broker.connect("c1").await.unwrap();
        let mut sub = conn
            .queue_subscribe(options("orders", "g", Offset::Oldest, 1))
            .await
            .unwrap();

        let first = sub.next().await.unwrap().unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(blocked.is_err());

        first.ack().await.unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(second.sequence(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivers_after_ack_wait() {
        let broker = MemoryBroker::new();
        broker.publish("orders", "a");

        let conn = broker.connect("c1").await.unwrap();
        let mut sub = conn
            .queue_subscribe(options("orders", "g", Offset::Oldest, 10))
            .await
            .unwrap();

        let first = sub.next().await.unwrap().unwrap();
        drop(first);

        let again = sub.next().await.unwrap().unwrap();
        assert_eq!(again.sequence(), 1);
    }

    #[tokio::test]
    async fn test_sever_fails_operations() {
        let broker = MemoryBroker::new();
        broker.publish("orders", "a");
        let conn = broker.connect("c1").await.unwrap();
        let mut sub = conn
            .queue_subscribe(options("orders", "g", Offset::Oldest, 10))
            .await
            .unwrap();
        let delivery = sub.next().await.unwrap().unwrap();

        broker.sever();
        tokio::time::timeout(Duration::from_secs(1), conn.disconnected())
            .await
            .expect("disconnect observed");
        assert!(matches!(delivery.ack().await, Err(BackendError::AckFailed(_))));
        assert!(matches!(
            conn.publish("orders", b"b".to_vec()).await,
            Err(BackendError::PublishFailed(_))
        ));
        assert!(matches!(sub.next().await, Some(Err(BackendError::Disconnected))));
        assert!(broker.connect("c2").await.is_err());

        broker.restore();
        assert!(broker.connect("c3").await.is_ok());
    }

    #[tokio::test]
    async fn test_close_tracks_open_resources() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("c1").await.unwrap();
        let mut sub = conn
            .queue_subscribe(options("orders", "g", Offset::Oldest, 10))
            .await
            .unwrap();
        assert_eq!(broker.open_connections(), 1);
        assert_eq!(broker.open_subscriptions(), 1);

        sub.close().await.unwrap();
        sub.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.open_subscriptions(), 0);
    }
}

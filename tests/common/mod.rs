//! Shared harness for bridge and gRPC tests

#![allow(dead_code)]

use proximo_gateway::backend::{AckBroker, SequentialIdSource};
use proximo_gateway::session::{
    run_consume, run_produce, Confirmation, ConsumeSettings, ConsumerConfig, Message, ProducerConfig,
    SessionResult,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TOPIC: &str = "orders";
pub const GROUP: &str = "billing";

/// Client side of a running consume session
pub struct ConsumeClient {
    pub cancel: CancellationToken,
    pub messages: mpsc::Receiver<Message>,
    pub confirmations: mpsc::Sender<Confirmation>,
    pub session: JoinHandle<SessionResult<()>>,
}

impl ConsumeClient {
    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.messages.recv())
            .await
            .expect("message within 5s")
            .expect("session still delivering")
    }

    pub async fn confirm(&self, id: &str) {
        self.confirmations
            .send(Confirmation::new(id))
            .await
            .expect("session still reading confirmations");
    }

    pub async fn finish(self) -> SessionResult<()> {
        tokio::time::timeout(Duration::from_secs(5), self.session)
            .await
            .expect("session ended within 5s")
            .expect("session task panicked")
    }
}

pub fn spawn_consume<B>(broker: &B, settings: ConsumeSettings, conf: ConsumerConfig) -> ConsumeClient
where
    B: AckBroker + Clone + 'static,
{
    let cancel = CancellationToken::new();
    let (for_client, messages) = mpsc::channel(1);
    let (confirmations, from_client) = mpsc::channel(1);

    let session = {
        let broker = broker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ids = SequentialIdSource::new("test-");
            run_consume(&broker, &ids, settings, cancel, conf, for_client, from_client).await
        })
    };

    ConsumeClient {
        cancel,
        messages,
        confirmations,
        session,
    }
}

pub fn settings(max_inflight: usize) -> ConsumeSettings {
    ConsumeSettings::new(max_inflight, Duration::from_secs(30))
}

/// Client side of a running produce session
pub struct ProduceClient {
    pub cancel: CancellationToken,
    pub messages: mpsc::Sender<Message>,
    pub confirmations: mpsc::Receiver<Confirmation>,
    pub session: JoinHandle<SessionResult<()>>,
}

impl ProduceClient {
    pub async fn send(&self, id: &str, data: &[u8]) {
        self.messages
            .send(Message {
                data: data.to_vec(),
                id: id.to_string(),
            })
            .await
            .expect("session still reading messages");
    }

    pub async fn finish(self) -> SessionResult<()> {
        tokio::time::timeout(Duration::from_secs(5), self.session)
            .await
            .expect("session ended within 5s")
            .expect("session task panicked")
    }
}

pub fn spawn_produce<B>(broker: B, conf: ProducerConfig) -> ProduceClient
where
    B: AckBroker + 'static,
{
    let cancel = CancellationToken::new();
    let (messages, from_client) = mpsc::channel(1);
    let (for_client, confirmations) = mpsc::channel(1);

    let session = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ids = SequentialIdSource::new("producer-");
            run_produce(&broker, &ids, cancel, conf, for_client, from_client).await
        })
    };

    ProduceClient {
        cancel,
        messages,
        confirmations,
        session,
    }
}

/// Poll until `check` holds, panicking after 5s
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Sum of the samples of `name` carrying every `label="value"` pair
/// Example: `metric{a="1",b="2"} 42` with `[("a", "1")]` -> 42.0
pub fn metric_sum(output: &str, name: &str, labels: &[(&str, &str)]) -> f64 {
    output
        .lines()
        .filter(|line| line.starts_with(&format!("{}{{", name)))
        .filter(|line| {
            labels
                .iter()
                .all(|(key, value)| line.contains(&format!("{}=\"{}\"", key, value)))
        })
        .filter_map(|line| line.split_whitespace().last())
        .filter_map(|value| value.parse::<f64>().ok())
        .sum()
}

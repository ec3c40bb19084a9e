//! Kafka sources and sinks.
//!
//! Kafka keeps a committed offset per partition instead of per-message acks,
//! so the source tracks its own in-flight queue: messages are identified as
//! `partition:offset`, confirmations must arrive in delivery order, and each
//! confirmed message commits `offset + 1` for its partition. Commits are
//! synchronous so a rejected commit fails the session before the next
//! confirmation is read.

use crate::backend::config::KafkaConfig;
use crate::backend::error::{BackendError, BackendResult};
use crate::backend::factory::{AsyncMessageSink, AsyncMessageSource, AsyncSinkFactory, AsyncSourceFactory};
use crate::metrics::GATEWAY_METRICS;
use crate::session::{
    Confirmation, ConsumerConfig, Message, Offset, ProducerConfig, SessionError, SessionResult,
};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Message as _, Offset as KafkaOffset, TopicPartitionList};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BACKEND: &str = "kafka";

/// Builds one consumer-group member per consume session
pub struct KafkaSourceFactory {
    config: KafkaConfig,
}

impl KafkaSourceFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    fn client_config(&self, conf: &ConsumerConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.config.bootstrap_servers())
            .set("group.id", &conf.consumer)
            .set("client.id", &conf.consumer)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", auto_offset_reset(conf.offset))
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string());

        if let Some(version) = &self.config.version {
            client_config.set("broker.version.fallback", version);
        }
        client_config
    }
}

#[async_trait]
impl AsyncSourceFactory for KafkaSourceFactory {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn new_async_source(&self, conf: &ConsumerConfig) -> BackendResult<Box<dyn AsyncMessageSource>> {
        let consumer: StreamConsumer = self
            .client_config(conf)
            .create()
            .map_err(|e| BackendError::ConnectionFailed(format!("Kafka consumer creation failed: {}", e)))?;

        consumer
            .subscribe(&[conf.topic.as_str()])
            .map_err(|e| BackendError::SubscribeFailed(format!("Kafka subscribe failed: {}", e)))?;

        Ok(Box::new(KafkaSource {
            consumer: Arc::new(consumer),
            topic: conf.topic.clone(),
            max_inflight: self.config.max_inflight,
        }))
    }
}

struct Pending {
    id: String,
    partition: i32,
    offset: i64,
}

struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
    max_inflight: usize,
}

impl KafkaSource {
    async fn commit(&self, pending: &Pending) -> BackendResult<()> {
        let offsets = commit_offsets(&self.topic, pending)?;
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|e| BackendError::AckFailed(format!("Kafka commit task failed: {}", e)))?
            .map_err(|e| BackendError::AckFailed(format!("Kafka commit failed: {}", e)))
    }
}

/// Offsets acknowledging `pending`: the next offset to read on its partition
fn commit_offsets(topic: &str, pending: &Pending) -> BackendResult<TopicPartitionList> {
    let mut offsets = TopicPartitionList::new();
    offsets
        .add_partition_offset(topic, pending.partition, KafkaOffset::Offset(pending.offset + 1))
        .map_err(|e| BackendError::AckFailed(format!("Kafka offset rejected: {}", e)))?;
    Ok(offsets)
}

#[async_trait]
impl AsyncMessageSource for KafkaSource {
    async fn consume_messages(
        &mut self,
        cancel: CancellationToken,
        for_client: mpsc::Sender<Message>,
        mut confirmations: mpsc::Receiver<Confirmation>,
    ) -> SessionResult<()> {
        let mut pending: VecDeque<Pending> = VecDeque::with_capacity(self.max_inflight);
        let consumer = &self.consumer;

        loop {
            let room = pending.len() < self.max_inflight;
            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                received = async { consumer.recv().await.map(|m| m.detach()) }, if room => {
                    let received = received.map_err(|e| {
                        SessionError::Backend(BackendError::ConsumeFailed(format!("Kafka recv failed: {}", e)))
                    })?;

                    let entry = Pending {
                        id: format!("{}:{}", received.partition(), received.offset()),
                        partition: received.partition(),
                        offset: received.offset(),
                    };
                    let message = Message {
                        data: received.payload().unwrap_or_default().to_vec(),
                        id: entry.id.clone(),
                    };
                    pending.push_back(entry);

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                        sent = for_client.send(message) => {
                            if sent.is_err() {
                                debug!(backend = BACKEND, "Client stopped receiving messages");
                                return Ok(());
                            }
                        }
                    }
                    GATEWAY_METRICS
                        .messages_delivered
                        .with_label_values(&[BACKEND])
                        .inc();
                }
                confirmation = confirmations.recv() => {
                    let Some(confirmation) = confirmation else {
                        return Ok(());
                    };
                    let Some(oldest) = pending.pop_front() else {
                        return Err(SessionError::UnsolicitedConfirmation(confirmation.msg_id));
                    };
                    if confirmation.msg_id != oldest.id {
                        return Err(SessionError::UnexpectedSequence {
                            got: confirmation.msg_id,
                            want: oldest.id,
                        });
                    }

                    self.commit(&oldest).await.map_err(SessionError::Backend)?;
                    GATEWAY_METRICS
                        .messages_confirmed
                        .with_label_values(&[BACKEND])
                        .inc();
                }
            }
        }
    }

    async fn close(&mut self) -> BackendResult<()> {
        // Every confirmed offset was committed synchronously; leave the
        // group so its partitions are reassigned.
        self.consumer.unsubscribe();
        Ok(())
    }
}

/// Builds one producer per produce session
pub struct KafkaSinkFactory {
    config: KafkaConfig,
}

impl KafkaSinkFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.config.bootstrap_servers())
            .set("message.timeout.ms", self.config.message_timeout_ms.to_string())
            .set("acks", "all");

        if let Some(version) = &self.config.version {
            client_config.set("broker.version.fallback", version);
        }
        client_config
    }
}

#[async_trait]
impl AsyncSinkFactory for KafkaSinkFactory {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn new_async_sink(&self, conf: &ProducerConfig) -> BackendResult<Box<dyn AsyncMessageSink>> {
        let producer: FutureProducer = self
            .client_config()
            .create()
            .map_err(|e| BackendError::ConnectionFailed(format!("Kafka producer creation failed: {}", e)))?;

        Ok(Box::new(KafkaSink {
            producer: Arc::new(producer),
            topic: conf.topic.clone(),
            flush_timeout: Duration::from_millis(self.config.message_timeout_ms),
        }))
    }
}

struct KafkaSink {
    producer: Arc<FutureProducer>,
    topic: String,
    flush_timeout: Duration,
}

#[async_trait]
impl AsyncMessageSink for KafkaSink {
    async fn publish_messages(
        &mut self,
        cancel: CancellationToken,
        for_client: mpsc::Sender<Confirmation>,
        mut messages: mpsc::Receiver<Message>,
    ) -> SessionResult<()> {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                message = messages.recv() => match message {
                    Some(message) => message,
                    None => return Ok(()),
                },
            };

            let started = Instant::now();
            let record: FutureRecord<'_, (), [u8]> = FutureRecord::to(&self.topic).payload(&message.data);
            if let Err((e, _)) = self.producer.send(record, Duration::from_secs(0)).await {
                GATEWAY_METRICS
                    .publish_failures
                    .with_label_values(&[BACKEND])
                    .inc();
                return Err(SessionError::Backend(BackendError::PublishFailed(format!(
                    "Kafka publish failed: {}",
                    e
                ))));
            }

            GATEWAY_METRICS
                .messages_published
                .with_label_values(&[BACKEND])
                .inc();
            GATEWAY_METRICS
                .publish_latency
                .with_label_values(&[BACKEND])
                .observe(started.elapsed().as_secs_f64());

            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                sent = for_client.send(Confirmation { msg_id: message.id }) => {
                    if sent.is_err() {
                        debug!(backend = BACKEND, "Client stopped receiving confirmations");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn close(&mut self) -> BackendResult<()> {
        let producer = self.producer.clone();
        let timeout = self.flush_timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BackendError::CloseFailed(format!("Kafka flush task failed: {}", e)))?
            .map_err(|e| BackendError::CloseFailed(format!("Kafka flush failed: {}", e)))
    }
}

fn auto_offset_reset(offset: Offset) -> &'static str {
    match offset {
        Offset::Default | Offset::Oldest => "earliest",
        Offset::Newest => "latest",
    }
}

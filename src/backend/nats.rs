//! NATS JetStream adapter.
//!
//! Every topic is a subject captured by its own stream, named from the
//! configured prefix and the topic. Consumer groups are durable pull
//! consumers with explicit acks, so unacknowledged messages come back to the
//! group after the ack wait whichever member reconnects.

use crate::backend::config::NatsConfig;
use crate::backend::error::{BackendError, BackendResult};
use crate::backend::id::IdSource;
use crate::backend::{AckBroker, BrokerConnection, Delivery, SubscribeOptions, Subscription};
use crate::session::Offset;
use async_nats::jetstream::{self, consumer, stream};
use async_nats::{Client, Event};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

/// JetStream-backed [`AckBroker`].
///
/// One client connection is shared by every session; sessions own only
/// their pull consumers.
pub struct NatsBroker {
    client: Client,
    jetstream: jetstream::Context,
    stream_prefix: String,
    /// Topics whose stream is known to exist
    streams: Arc<Mutex<HashSet<String>>>,
    /// True while the shared client is connected
    link: Arc<watch::Sender<bool>>,
}

impl NatsBroker {
    /// Connect the shared client and check the server answers
    pub async fn connect(config: NatsConfig, ids: &dyn IdSource) -> BackendResult<Self> {
        let (link_tx, _) = watch::channel(true);
        let link = Arc::new(link_tx);

        let events = link.clone();
        let client = async_nats::ConnectOptions::new()
            .name(format!("{}-{}", config.connection_name, ids.next_id()))
            .event_callback(move |event| {
                let events = events.clone();
                async move {
                    match event {
                        Event::Disconnected => {
                            events.send_replace(false);
                        }
                        Event::Connected => {
                            events.send_replace(true);
                        }
                        other => tracing::debug!(event = ?other, "NATS client event"),
                    }
                }
            })
            .connect(&config.url)
            .await
            .map_err(|e| BackendError::ConnectionFailed(format!("NATS connection failed: {}", e)))?;
        client
            .flush()
            .await
            .map_err(|e| BackendError::ConnectionFailed(format!("NATS flush failed: {}", e)))?;

        Ok(Self {
            jetstream: jetstream::new(client.clone()),
            client,
            stream_prefix: config.stream_prefix,
            streams: Arc::new(Mutex::new(HashSet::new())),
            link,
        })
    }
}

#[async_trait]
impl AckBroker for NatsBroker {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn connect(&self, client_id: &str) -> BackendResult<Box<dyn BrokerConnection>> {
        if !*self.link.borrow() {
            return Err(BackendError::ConnectionFailed(format!(
                "NATS link down for client {}",
                client_id
            )));
        }

        Ok(Box::new(NatsConnection {
            client: self.client.clone(),
            jetstream: self.jetstream.clone(),
            stream_prefix: self.stream_prefix.clone(),
            streams: self.streams.clone(),
            link: self.link.clone(),
        }))
    }
}

/// A session's view of the shared client. Closing it flushes pending
/// publishes but leaves the client open for other sessions.
struct NatsConnection {
    client: Client,
    jetstream: jetstream::Context,
    stream_prefix: String,
    streams: Arc<Mutex<HashSet<String>>>,
    link: Arc<watch::Sender<bool>>,
}

impl NatsConnection {
    async fn ensure_stream(&self, topic: &str) -> BackendResult<stream::Stream> {
        let stream = self
            .jetstream
            .get_or_create_stream(stream::Config {
                name: stream_name(&self.stream_prefix, topic),
                subjects: vec![topic.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| BackendError::SubscribeFailed(format!("JetStream stream setup failed: {}", e)))?;
        self.streams.lock().insert(topic.to_string());
        Ok(stream)
    }
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    async fn queue_subscribe(&self, options: SubscribeOptions) -> BackendResult<Box<dyn Subscription>> {
        let stream = self.ensure_stream(&options.topic).await?;

        let durable = durable_name(&options.group);
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: options.ack_wait,
                    max_ack_pending: options.max_inflight as i64,
                    deliver_policy: deliver_policy(options.start),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BackendError::SubscribeFailed(format!("JetStream consumer setup failed: {}", e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BackendError::SubscribeFailed(format!("JetStream pull failed: {}", e)))?;

        tracing::debug!(topic = %options.topic, durable = %durable, "JetStream subscription opened");
        Ok(Box::new(NatsSubscription {
            messages: Some(messages),
        }))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BackendResult<()> {
        let known = self.streams.lock().contains(topic);
        if !known {
            self.ensure_stream(topic)
                .await
                .map_err(|e| BackendError::PublishFailed(e.to_string()))?;
        }

        self.jetstream
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(|e| BackendError::PublishFailed(format!("JetStream publish failed: {}", e)))?
            .await
            .map_err(|e| BackendError::PublishFailed(format!("JetStream publish not acknowledged: {}", e)))?;
        Ok(())
    }

    async fn disconnected(&self) {
        let mut link = self.link.subscribe();
        let lost = link.wait_for(|up| !*up).await.is_ok();
        if !lost {
            // Sender gone: the link can no longer change.
            std::future::pending::<()>().await;
        }
    }

    async fn close(&self) -> BackendResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BackendError::CloseFailed(format!("NATS flush failed: {}", e)))
    }
}

struct NatsSubscription {
    messages: Option<consumer::pull::Stream>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Option<BackendResult<Box<dyn Delivery>>> {
        let messages = self.messages.as_mut()?;
        let message = match messages.next().await? {
            Ok(message) => message,
            Err(e) => {
                return Some(Err(BackendError::ConsumeFailed(format!(
                    "JetStream delivery failed: {}",
                    e
                ))))
            }
        };

        let sequence = match message.info() {
            Ok(info) => info.stream_sequence,
            Err(e) => {
                return Some(Err(BackendError::ConsumeFailed(format!(
                    "JetStream delivery without metadata: {}",
                    e
                ))))
            }
        };

        Some(Ok(Box::new(NatsDelivery { message, sequence })))
    }

    async fn close(&mut self) -> BackendResult<()> {
        // Dropping the pull stream stops fetching; the durable consumer stays.
        self.messages.take();
        Ok(())
    }
}

struct NatsDelivery {
    message: jetstream::Message,
    sequence: u64,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&self) -> BackendResult<()> {
        self.message
            .double_ack()
            .await
            .map_err(|e| BackendError::AckFailed(format!("JetStream ack failed: {}", e)))
    }
}

fn deliver_policy(start: Offset) -> consumer::DeliverPolicy {
    match start {
        Offset::Default | Offset::Oldest => consumer::DeliverPolicy::All,
        Offset::Newest => consumer::DeliverPolicy::New,
    }
}

/// Stream and consumer names may not contain `.`, `*`, `>` or whitespace
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn stream_name(prefix: &str, topic: &str) -> String {
    format!("{}_{}", sanitize(prefix), sanitize(topic))
}

fn durable_name(group: &str) -> String {
    sanitize(group)
}

//! Backend configuration

use crate::backend::error::{BackendError, BackendResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker family serving all sessions of this process
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// NATS JetStream - durable, ack-based pub/sub
    Nats,
    /// Kafka - partitioned log
    Kafka,
    /// In-process broker, no persistence across restarts
    #[default]
    Mem,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Nats => "nats",
            BackendKind::Kafka => "kafka",
            BackendKind::Mem => "mem",
        }
    }
}

/// NATS JetStream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub url: String,

    /// Prefix of the client connection name
    #[serde(default = "default_connection_name")]
    pub connection_name: String,

    /// Maximum unacknowledged messages per consume session
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,

    /// Seconds before the broker redelivers an unacknowledged message
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,

    /// Prefix of the JetStream stream created for each topic
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
}

impl NatsConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            connection_name: default_connection_name(),
            max_inflight: default_max_inflight(),
            ack_wait_secs: default_ack_wait_secs(),
            stream_prefix: default_stream_prefix(),
        }
    }
}

/// Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap brokers
    #[serde(default = "default_kafka_brokers")]
    pub brokers: Vec<String>,

    /// Protocol version assumed for brokers that cannot report it
    #[serde(default)]
    pub version: Option<String>,

    /// Maximum unconfirmed messages per consume session
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,

    /// Consumer group session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Producer delivery timeout in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

impl KafkaConfig {
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_kafka_brokers(),
            version: None,
            max_inflight: default_max_inflight(),
            session_timeout_ms: default_session_timeout_ms(),
            message_timeout_ms: default_message_timeout_ms(),
        }
    }
}

/// In-memory broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,

    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
}

impl MemoryConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            ack_wait_secs: default_ack_wait_secs(),
        }
    }
}

/// Backend selection plus per-backend settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    #[serde(default)]
    pub nats: NatsConfig,

    #[serde(default)]
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub mem: MemoryConfig,
}

impl BackendConfig {
    /// Reject settings of the selected backend that no session could run with
    pub fn validate(&self) -> BackendResult<()> {
        let max_inflight = match self.kind {
            BackendKind::Nats => {
                if self.nats.url.trim().is_empty() {
                    return Err(BackendError::ConfigurationError("nats url is required".to_string()));
                }
                if self.nats.ack_wait_secs == 0 {
                    return Err(BackendError::ConfigurationError(
                        "nats ack_wait_secs must be positive".to_string(),
                    ));
                }
                self.nats.max_inflight
            }
            BackendKind::Kafka => {
                if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
                    return Err(BackendError::ConfigurationError(
                        "at least one kafka broker is required".to_string(),
                    ));
                }
                self.kafka.max_inflight
            }
            BackendKind::Mem => self.mem.max_inflight,
        };

        if max_inflight == 0 {
            return Err(BackendError::ConfigurationError(
                "max_inflight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_connection_name() -> String {
    "proximo-nats".to_string()
}

fn default_max_inflight() -> usize {
    10
}

fn default_ack_wait_secs() -> u64 {
    60
}

fn default_stream_prefix() -> String {
    "proximo".to_string()
}

fn default_kafka_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_message_timeout_ms() -> u64 {
    30000
}

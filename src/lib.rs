//! Proximo gateway: one bidirectional-streaming consume/produce protocol in
//! front of interchangeable message brokers.
//!
//! - [`session`] holds the streaming bridge: the consume and produce session
//!   drivers and the bounded in-flight acknowledgement window.
//! - [`backend`] adapts NATS JetStream, Kafka and an in-process broker.
//! - [`grpc`] exposes `proximo.MessageSource` and `proximo.MessageSink`.
//! - [`api`] serves health and Prometheus endpoints.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod grpc;
pub mod metrics;
pub mod session;

pub use error::{GatewayError, Result};

//! Prometheus metrics for gateway sessions

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder, GaugeVec,
    HistogramVec, TextEncoder,
};

/// Gateway metrics
pub struct GatewayMetrics {
    /// Sessions currently running
    pub active_sessions: GaugeVec,

    /// Sessions ended, by outcome
    pub sessions_ended: CounterVec,

    /// Messages handed to consume clients
    pub messages_delivered: CounterVec,

    /// Confirmations matched and acknowledged to the broker
    pub messages_confirmed: CounterVec,

    /// Messages accepted by the broker for produce clients
    pub messages_published: CounterVec,

    /// Publishes rejected by the broker
    pub publish_failures: CounterVec,

    /// Publish round trip latency
    pub publish_latency: HistogramVec,
}

lazy_static! {
    pub static ref GATEWAY_METRICS: GatewayMetrics = GatewayMetrics {
        active_sessions: register_gauge_vec!(
            "proximo_active_sessions",
            "Number of running consume and produce sessions",
            &["kind", "backend"]
        )
        .unwrap(),

        sessions_ended: register_counter_vec!(
            "proximo_sessions_ended_total",
            "Total number of sessions ended",
            &["kind", "backend", "outcome"]
        )
        .unwrap(),

        messages_delivered: register_counter_vec!(
            "proximo_messages_delivered_total",
            "Total number of messages delivered to consume clients",
            &["backend"]
        )
        .unwrap(),

        messages_confirmed: register_counter_vec!(
            "proximo_messages_confirmed_total",
            "Total number of consume confirmations acknowledged to the broker",
            &["backend"]
        )
        .unwrap(),

        messages_published: register_counter_vec!(
            "proximo_messages_published_total",
            "Total number of messages published for produce clients",
            &["backend"]
        )
        .unwrap(),

        publish_failures: register_counter_vec!(
            "proximo_publish_failures_total",
            "Total number of publishes rejected by the broker",
            &["backend"]
        )
        .unwrap(),

        publish_latency: register_histogram_vec!(
            "proximo_publish_latency_seconds",
            "Broker publish latency in seconds",
            &["backend"]
        )
        .unwrap(),
    };
}

/// Initialize gateway metrics
pub fn init_metrics() {
    lazy_static::initialize(&GATEWAY_METRICS);
}

/// Render every registered metric in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

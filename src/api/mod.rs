//! Operational HTTP endpoints served next to the gRPC listener.

pub mod handlers;
pub mod routes;

pub use routes::*;

use crate::error::Result;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

/// Shared probe state
#[derive(Clone)]
pub struct ProbeState {
    /// Label of the backend serving sessions
    pub backend: &'static str,
    pub metrics_enabled: bool,
}

impl ProbeState {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            metrics_enabled: true,
        }
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }
}

/// Serve the probe endpoints on `addr` until `shutdown` fires
pub async fn serve_probe(addr: SocketAddr, state: ProbeState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Probe endpoints listening on {}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

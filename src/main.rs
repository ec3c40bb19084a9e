use anyhow::Context;
use clap::Parser;
use proximo_gateway::{
    api::{serve_probe, ProbeState},
    backend::{build_handlers, BackendKind, UuidIdSource},
    config::Config,
    grpc::start_grpc_server,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Proximo gateway server
#[derive(Parser, Debug)]
#[command(name = "proximo-gateway")]
#[command(about = "Bridges the proximo streaming protocol onto NATS, Kafka or an in-memory broker", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file layered over the built-in defaults
    #[arg(short, long, env = "PROXIMO_CONFIG")]
    config: Option<PathBuf>,

    /// Broker serving all sessions
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// gRPC listen port
    #[arg(long)]
    grpc_port: Option<u16>,

    /// Health and metrics listen port
    #[arg(long)]
    probe_port: Option<u16>,

    /// NATS server URL
    #[arg(long)]
    nats_url: Option<String>,

    /// Kafka bootstrap brokers
    #[arg(long, value_delimiter = ',')]
    kafka_brokers: Option<Vec<String>>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(kind) = self.backend {
            config.backend.kind = kind;
        }
        if let Some(port) = self.grpc_port {
            config.server.grpc_port = port;
        }
        if let Some(port) = self.probe_port {
            config.server.probe_port = port;
        }
        if let Some(url) = self.nats_url {
            config.backend.nats.url = url;
        }
        if let Some(brokers) = self.kafka_brokers {
            config.backend.kafka.brokers = brokers;
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.observability.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.observability.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Load the layered configuration, apply flag overrides, then validate once
fn resolve_config(args: Args) -> anyhow::Result<Config> {
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = resolve_config(Args::parse())?;

    init_tracing(&config);
    tracing::info!("Starting proximo gateway v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(backend = config.backend.kind.as_str(), "Backend selected");

    if config.observability.prometheus_enabled {
        proximo_gateway::metrics::init_metrics();
    }

    let handlers = build_handlers(&config.backend, Arc::new(UuidIdSource))
        .await
        .context("Failed to set up backend")?;

    let shutdown = CancellationToken::new();

    let grpc_addr = config.server.grpc_addr()?;
    let mut grpc_handle = tokio::spawn(start_grpc_server(grpc_addr, handlers, shutdown.clone()));

    let probe_handle = if config.server.probe_enabled {
        let state = ProbeState::new(config.backend.kind.as_str())
            .with_metrics(config.observability.prometheus_enabled);
        Some(tokio::spawn(serve_probe(
            config.server.probe_addr()?,
            state,
            shutdown.clone(),
        )))
    } else {
        None
    };

    let stopped_early = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown signal received");
            None
        }
        joined = &mut grpc_handle => {
            tracing::warn!("gRPC server stopped");
            Some(joined)
        }
    };

    tracing::info!("Shutting down gracefully...");
    shutdown.cancel();

    let joined = match stopped_early {
        Some(joined) => joined,
        None => grpc_handle.await,
    };
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("gRPC server error: {}", e),
        Err(e) => tracing::error!("gRPC server task failed: {}", e),
    }
    if let Some(handle) = probe_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Probe server error: {}", e),
            Err(e) => tracing::error!("Probe server task failed: {}", e),
        }
    }

    Ok(())
}

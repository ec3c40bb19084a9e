use crate::backend::Handlers;
use crate::error::Result;
use crate::grpc::message_sink_server::MessageSinkServer;
use crate::grpc::message_source_server::MessageSourceServer;
use crate::grpc::{MessageSinkService, MessageSourceService};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::Server;

/// Both services over one set of handlers. Sessions are children of `shutdown`.
pub fn router(handlers: &Handlers, shutdown: &CancellationToken) -> Router {
    Server::builder()
        .add_service(MessageSourceServer::new(MessageSourceService::new(
            handlers.consume.clone(),
            shutdown.clone(),
        )))
        .add_service(MessageSinkServer::new(MessageSinkService::new(
            handlers.produce.clone(),
            shutdown.clone(),
        )))
}

/// Serve gRPC on `addr` until `shutdown` fires
pub async fn start_grpc_server(addr: SocketAddr, handlers: Handlers, shutdown: CancellationToken) -> Result<()> {
    tracing::info!("Starting gRPC server on {}", addr);

    let signal = shutdown.clone();
    router(&handlers, &shutdown)
        .serve_with_shutdown(addr, async move { signal.cancelled().await })
        .await?;

    tracing::info!("gRPC server stopped");
    Ok(())
}

/// Serve gRPC on an already bound listener until `shutdown` fires
pub async fn serve_on_listener(listener: TcpListener, handlers: Handlers, shutdown: CancellationToken) -> Result<()> {
    let signal = shutdown.clone();
    router(&handlers, &shutdown)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            signal.cancelled().await
        })
        .await?;
    Ok(())
}

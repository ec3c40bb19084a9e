use super::message_source_server::MessageSource;
use super::proto::{self, ConsumerRequest};
use super::{outcome_label, session_status, OUTBOUND_BUFFER};
use crate::metrics::GATEWAY_METRICS;
use crate::session::{Confirmation, ConsumeHandler, ConsumerConfig, Message};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

/// `proximo.MessageSource` backed by a [`ConsumeHandler`]
pub struct MessageSourceService {
    handler: Arc<dyn ConsumeHandler>,
    shutdown: CancellationToken,
}

impl MessageSourceService {
    /// Sessions are cancelled when `shutdown` fires
    pub fn new(handler: Arc<dyn ConsumeHandler>, shutdown: CancellationToken) -> Self {
        Self { handler, shutdown }
    }
}

#[tonic::async_trait]
impl MessageSource for MessageSourceService {
    type ConsumeStream = ReceiverStream<Result<proto::Message, Status>>;

    async fn consume(
        &self,
        request: Request<Streaming<ConsumerRequest>>,
    ) -> Result<Response<Self::ConsumeStream>, Status> {
        let mut inbound = request.into_inner();
        let conf = read_start(&mut inbound).await?;
        conf.validate().map_err(|e| session_status(&e))?;

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        tokio::spawn(serve_consume(
            self.handler.clone(),
            self.shutdown.child_token(),
            conf,
            inbound,
            out_tx,
        ));

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

async fn read_start(inbound: &mut Streaming<ConsumerRequest>) -> Result<ConsumerConfig, Status> {
    match inbound.message().await? {
        Some(ConsumerRequest {
            start_request: Some(start),
            ..
        }) => Ok(start.into_config()),
        Some(_) => Err(Status::invalid_argument(
            "first consume request must be a start request",
        )),
        None => Err(Status::invalid_argument("stream closed before start request")),
    }
}

async fn serve_consume(
    handler: Arc<dyn ConsumeHandler>,
    session: CancellationToken,
    conf: ConsumerConfig,
    inbound: Streaming<ConsumerRequest>,
    out_tx: mpsc::Sender<Result<proto::Message, Status>>,
) {
    let backend = handler.backend();
    let active = GATEWAY_METRICS
        .active_sessions
        .with_label_values(&["consume", backend]);
    active.inc();

    let (for_client_tx, mut for_client_rx) = mpsc::channel::<Message>(1);
    let (confirm_tx, confirm_rx) = mpsc::channel::<Confirmation>(1);

    let reader = tokio::spawn(read_confirmations(session.clone(), inbound, confirm_tx));

    let writer = {
        let session = session.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = for_client_rx.recv().await {
                if out_tx.send(Ok(msg.into())).await.is_err() {
                    session.cancel();
                    return;
                }
            }
        })
    };

    let result = handler
        .handle_consume(session.clone(), conf.clone(), for_client_tx, confirm_rx)
        .await;

    session.cancel();
    let violation = reader.await.unwrap_or(None);
    let _ = writer.await;

    active.dec();
    GATEWAY_METRICS
        .sessions_ended
        .with_label_values(&["consume", backend, outcome_label(&result)])
        .inc();

    let status = match (violation, &result) {
        (Some(status), _) => Some(status),
        (None, Err(err)) if !err.is_cancelled() => Some(session_status(err)),
        _ => None,
    };
    if let Some(status) = status {
        warn!(topic = %conf.topic, consumer = %conf.consumer, code = ?status.code(), "Consume stream failed");
        let _ = out_tx.send(Err(status)).await;
    }
}

/// Forward confirmations until the session ends, the client half-closes or
/// breaks framing. Returns the status to report for a framing violation.
async fn read_confirmations(
    session: CancellationToken,
    mut inbound: Streaming<ConsumerRequest>,
    confirm_tx: mpsc::Sender<Confirmation>,
) -> Option<Status> {
    loop {
        let request = tokio::select! {
            _ = session.cancelled() => return None,
            request = inbound.message() => request,
        };

        match request {
            Ok(Some(ConsumerRequest {
                start_request: None,
                confirmation: Some(confirmation),
            })) => {
                tokio::select! {
                    _ = session.cancelled() => return None,
                    sent = confirm_tx.send(confirmation.into()) => {
                        if sent.is_err() {
                            return None;
                        }
                    }
                }
            }
            Ok(Some(_)) => {
                session.cancel();
                return Some(Status::invalid_argument(
                    "consume requests after the first must carry only a confirmation",
                ));
            }
            Ok(None) => {
                debug!("Consume client half-closed");
                session.cancel();
                return None;
            }
            Err(status) => {
                debug!(code = ?status.code(), "Consume client stream failed");
                session.cancel();
                return None;
            }
        }
    }
}

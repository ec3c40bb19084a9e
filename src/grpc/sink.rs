use super::message_sink_server::MessageSink;
use super::proto::{self, PublisherRequest};
use super::{outcome_label, session_status, OUTBOUND_BUFFER};
use crate::metrics::GATEWAY_METRICS;
use crate::session::{Confirmation, Message, ProduceHandler, ProducerConfig};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

/// `proximo.MessageSink` backed by a [`ProduceHandler`]
pub struct MessageSinkService {
    handler: Arc<dyn ProduceHandler>,
    shutdown: CancellationToken,
}

impl MessageSinkService {
    pub fn new(handler: Arc<dyn ProduceHandler>, shutdown: CancellationToken) -> Self {
        Self { handler, shutdown }
    }
}

#[tonic::async_trait]
impl MessageSink for MessageSinkService {
    type PublishStream = ReceiverStream<Result<proto::Confirmation, Status>>;

    async fn publish(
        &self,
        request: Request<Streaming<PublisherRequest>>,
    ) -> Result<Response<Self::PublishStream>, Status> {
        let mut inbound = request.into_inner();
        let conf = match inbound.message().await? {
            Some(PublisherRequest {
                start_request: Some(start),
                ..
            }) => ProducerConfig::new(start.topic),
            Some(_) => {
                return Err(Status::invalid_argument(
                    "first publish request must be a start request",
                ))
            }
            None => return Err(Status::invalid_argument("stream closed before start request")),
        };
        conf.validate().map_err(|e| session_status(&e))?;

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        tokio::spawn(serve_produce(
            self.handler.clone(),
            self.shutdown.child_token(),
            conf,
            inbound,
            out_tx,
        ));

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

async fn serve_produce(
    handler: Arc<dyn ProduceHandler>,
    session: CancellationToken,
    conf: ProducerConfig,
    inbound: Streaming<PublisherRequest>,
    out_tx: mpsc::Sender<Result<proto::Confirmation, Status>>,
) {
    let backend = handler.backend();
    let active = GATEWAY_METRICS
        .active_sessions
        .with_label_values(&["produce", backend]);
    active.inc();

    let (for_client_tx, mut for_client_rx) = mpsc::channel::<Confirmation>(1);
    let (messages_tx, messages_rx) = mpsc::channel::<Message>(1);

    let reader = tokio::spawn(read_messages(session.clone(), inbound, messages_tx));

    let writer = {
        let session = session.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(confirmation) = for_client_rx.recv().await {
                if out_tx.send(Ok(confirmation.into())).await.is_err() {
                    session.cancel();
                    return;
                }
            }
        })
    };

    let result = handler
        .handle_produce(session.clone(), conf.clone(), for_client_tx, messages_rx)
        .await;

    session.cancel();
    let violation = reader.await.unwrap_or(None);
    let _ = writer.await;

    active.dec();
    GATEWAY_METRICS
        .sessions_ended
        .with_label_values(&["produce", backend, outcome_label(&result)])
        .inc();

    let status = match (violation, &result) {
        (Some(status), _) => Some(status),
        (None, Err(err)) if !err.is_cancelled() => Some(session_status(err)),
        _ => None,
    };
    if let Some(status) = status {
        warn!(topic = %conf.topic, code = ?status.code(), "Publish stream failed");
        let _ = out_tx.send(Err(status)).await;
    }
}

/// Forward client messages. A half-close drops the sender so the session
/// finishes the messages already read and ends cleanly.
async fn read_messages(
    session: CancellationToken,
    mut inbound: Streaming<PublisherRequest>,
    messages_tx: mpsc::Sender<Message>,
) -> Option<Status> {
    loop {
        let request = tokio::select! {
            _ = session.cancelled() => return None,
            request = inbound.message() => request,
        };

        match request {
            Ok(Some(PublisherRequest {
                start_request: None,
                msg: Some(msg),
            })) => {
                tokio::select! {
                    _ = session.cancelled() => return None,
                    sent = messages_tx.send(msg.into()) => {
                        if sent.is_err() {
                            return None;
                        }
                    }
                }
            }
            Ok(Some(_)) => {
                session.cancel();
                return Some(Status::invalid_argument(
                    "publish requests after the first must carry only a message",
                ));
            }
            Ok(None) => {
                debug!("Publish client half-closed");
                return None;
            }
            Err(status) => {
                debug!(code = ?status.code(), "Publish client stream failed");
                session.cancel();
                return None;
            }
        }
    }
}

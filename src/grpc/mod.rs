//! gRPC surface: `proximo.MessageSource` and `proximo.MessageSink`.

pub mod proto;
pub mod server;
mod sink;
mod source;

pub use server::{router, serve_on_listener, start_grpc_server};
pub use sink::MessageSinkService;
pub use source::MessageSourceService;

include!(concat!(env!("OUT_DIR"), "/proximo.MessageSource.rs"));
include!(concat!(env!("OUT_DIR"), "/proximo.MessageSink.rs"));

use crate::session::SessionError;
use tonic::Status;

/// Messages buffered between a session and the response stream
const OUTBOUND_BUFFER: usize = 16;

/// Terminal gRPC status for a failed session
pub fn session_status(err: &SessionError) -> Status {
    match err {
        SessionError::Cancelled => Status::cancelled(err.to_string()),
        SessionError::Configuration(_) => Status::invalid_argument(err.to_string()),
        SessionError::UnparseableSequence(_)
        | SessionError::UnexpectedSequence { .. }
        | SessionError::UnsolicitedConfirmation(_) => Status::failed_precondition(err.to_string()),
        SessionError::Connection(_) | SessionError::Backend(_) => Status::unavailable(err.to_string()),
        SessionError::Task(_) | SessionError::Close(_) | SessionError::Release { .. } => {
            Status::internal(err.to_string())
        }
    }
}

/// Outcome label recorded when a session ends
fn outcome_label(result: &Result<(), SessionError>) -> &'static str {
    match result {
        Ok(()) => "client_closed",
        Err(err) => err.kind(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::session::CloseErrors;
    use tonic::Code;

    #[test]
    fn test_session_status_codes() {
        assert_eq!(session_status(&SessionError::Cancelled).code(), Code::Cancelled);
        assert_eq!(
            session_status(&SessionError::Configuration("topic is required".into())).code(),
            Code::InvalidArgument
        );
        assert_eq!(
            session_status(&SessionError::UnexpectedSequence {
                got: "6".into(),
                want: "5".into()
            })
            .code(),
            Code::FailedPrecondition
        );
        assert_eq!(
            session_status(&SessionError::Backend(BackendError::Disconnected)).code(),
            Code::Unavailable
        );

        let close: CloseErrors = std::iter::once(Err(BackendError::CloseFailed("x".into()))).collect();
        assert_eq!(session_status(&SessionError::Close(close)).code(), Code::Internal);
    }

    #[test]
    fn test_outcome_label() {
        assert_eq!(outcome_label(&Ok(())), "client_closed");
        assert_eq!(outcome_label(&Err(SessionError::Cancelled)), "cancelled");
    }
}

//! Session-terminal error taxonomy

use crate::backend::BackendError;
use std::fmt;

/// Result type for a consume or produce session
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Why a session ended
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The caller cancelled the session
    #[error("session cancelled")]
    Cancelled,

    /// Session parameters were rejected before any broker resource was opened
    #[error("invalid session configuration: {0}")]
    Configuration(String),

    /// Broker resources for the session could not be opened
    #[error("failed to open backend session: {0}")]
    Connection(#[source] BackendError),

    /// A confirmation carried an identifier that is not a broker sequence
    #[error("failed to parse message sequence '{0}'")]
    UnparseableSequence(String),

    /// A confirmation did not match the oldest unacknowledged delivery
    #[error("unexpected message sequence. was {got} but wanted {want}")]
    UnexpectedSequence { got: String, want: String },

    /// A confirmation arrived while nothing was awaiting one
    #[error("confirmation '{0}' does not match any delivered message")]
    UnsolicitedConfirmation(String),

    /// The broker failed while the session was running
    #[error("backend failure: {0}")]
    Backend(#[source] BackendError),

    /// A session task stopped without reporting an outcome
    #[error("session task failed: {0}")]
    Task(String),

    /// Releasing resources failed after an otherwise clean end
    #[error("failed to release session resources: {0}")]
    Close(CloseErrors),

    /// Releasing resources failed after the session had already ended with `cause`
    #[error("{cause}; releasing session resources also failed: {close}")]
    Release {
        cause: Box<SessionError>,
        close: CloseErrors,
    },
}

impl SessionError {
    /// True only for a bare caller-initiated cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }

    /// True when the client broke the confirmation protocol
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            SessionError::UnparseableSequence(_)
            | SessionError::UnexpectedSequence { .. }
            | SessionError::UnsolicitedConfirmation(_) => true,
            SessionError::Release { cause, .. } => cause.is_protocol_violation(),
            _ => false,
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Cancelled => "cancelled",
            SessionError::Configuration(_) => "configuration",
            SessionError::Connection(_) => "connection",
            SessionError::UnparseableSequence(_)
            | SessionError::UnexpectedSequence { .. }
            | SessionError::UnsolicitedConfirmation(_) => "protocol",
            SessionError::Backend(_) => "backend",
            SessionError::Task(_) => "task",
            SessionError::Close(_) | SessionError::Release { .. } => "release",
        }
    }
}

/// Every failure collected while closing a set of broker resources
#[derive(Debug, Default)]
pub struct CloseErrors(Vec<BackendError>);

impl CloseErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the error, if any, from one close call
    pub fn record(&mut self, result: Result<(), BackendError>) {
        if let Err(err) = result {
            self.0.push(err);
        }
    }

    pub fn errors(&self) -> &[BackendError] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), CloseErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl FromIterator<Result<(), BackendError>> for CloseErrors {
    fn from_iter<I: IntoIterator<Item = Result<(), BackendError>>>(iter: I) -> Self {
        let mut errors = CloseErrors::new();
        for result in iter {
            errors.record(result);
        }
        errors
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{}", single),
            errors => {
                write!(f, "{} errors occurred:", errors.len())?;
                for err in errors {
                    write!(f, "\n\t* {}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CloseErrors {}

/// Combine a session outcome with the result of releasing its resources
pub(crate) fn conclude(outcome: SessionResult<()>, closed: Result<(), CloseErrors>) -> SessionResult<()> {
    match (outcome, closed) {
        (outcome, Ok(())) => outcome,
        (Ok(()), Err(close)) => Err(SessionError::Close(close)),
        (Err(cause), Err(close)) => Err(SessionError::Release {
            cause: Box::new(cause),
            close,
        }),
    }
}

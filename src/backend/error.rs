//! Error types for broker adapters

/// Result type for broker adapter operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors raised by a broker adapter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Connection to the broker could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Subscription could not be created
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Broker rejected or never confirmed a publish
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Broker rejected an acknowledgement
    #[error("Ack failed: {0}")]
    AckFailed(String),

    /// Delivery stream failed
    #[error("Consume failed: {0}")]
    ConsumeFailed(String),

    /// Releasing a broker resource failed
    #[error("Close failed: {0}")]
    CloseFailed(String),

    /// Link to the broker was lost
    #[error("Broker link lost")]
    Disconnected,

    /// Adapter configuration is unusable
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

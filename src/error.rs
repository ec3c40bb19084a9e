use crate::backend::BackendError;
use thiserror::Error;

/// Process-level errors: startup, configuration and transport
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backend could not be set up
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// gRPC transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Listen address could not be parsed
    #[error("Invalid address '{0}'")]
    Address(String),
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Configuration(err.to_string())
    }
}

/// Result type alias for process-level operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_conversion() {
        let err: GatewayError = BackendError::ConnectionFailed("refused".to_string()).into();
        assert!(matches!(err, GatewayError::Backend(_)));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_config_error_conversion() {
        let err: GatewayError = config::ConfigError::Message("bad port".to_string()).into();
        assert_eq!(err.to_string(), "Configuration error: bad port");
    }
}

//! Server error types.

use hostbridge_protocol::ErrorKind;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] hostbridge_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] hostbridge_core::CoreError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Maps to the error kind reported on the wire.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ServerError::Protocol(_) => ErrorKind::MalformedRequest,
            ServerError::Core(e) => e.error_kind(),
            ServerError::ShuttingDown => ErrorKind::ServerShuttingDown,
            ServerError::Io(_) | ServerError::Config(_) | ServerError::Metrics(_) => {
                ErrorKind::HostExecutionError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostbridge_core::CoreError;
    use hostbridge_protocol::ProtocolError;

    #[test]
    fn test_error_kind_mapping() {
        let err = ServerError::from(ProtocolError::malformed(None, "missing kind"));
        assert_eq!(err.error_kind(), ErrorKind::MalformedRequest);

        let err = ServerError::from(CoreError::ShuttingDown);
        assert_eq!(err.error_kind(), ErrorKind::ServerShuttingDown);

        assert_eq!(
            ServerError::ShuttingDown.error_kind(),
            ErrorKind::ServerShuttingDown
        );
    }
}

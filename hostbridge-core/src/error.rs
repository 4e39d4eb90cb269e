//! Core error types.

use crate::command::{Command, RequestId};
use hostbridge_protocol::ErrorKind;
use thiserror::Error;

/// Errors from the request registry and command intake.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("request id already pending: {id}")]
    DuplicateRequestId { id: RequestId },

    #[error("server is shutting down")]
    ShuttingDown,
}

impl CoreError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            CoreError::DuplicateRequestId { .. } => ErrorKind::DuplicateRequestId,
            CoreError::ShuttingDown => ErrorKind::ServerShuttingDown,
        }
    }
}

/// Enqueue failures. The rejected command is handed back to the caller.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("command queue is full")]
    Backpressure(Command),

    #[error("command queue is closed")]
    Closed(Command),
}

impl QueueError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            QueueError::Backpressure(_) => ErrorKind::ServerBusy,
            QueueError::Closed(_) => ErrorKind::ServerShuttingDown,
        }
    }

    pub fn into_command(self) -> Command {
        match self {
            QueueError::Backpressure(cmd) | QueueError::Closed(cmd) => cmd,
        }
    }
}

/// Failures reported by a host capability.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// The host refused the operation, e.g. an unknown target or action.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The operation failed while running.
    #[error("fault: {0}")]
    Fault(String),

    /// The host considers its own state compromised.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HostError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HostError::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HostError::Rejected(m) | HostError::Fault(m) | HostError::Fatal(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_kinds() {
        let err = CoreError::DuplicateRequestId { id: RequestId::new(4) };
        assert_eq!(err.error_kind(), ErrorKind::DuplicateRequestId);
        assert!(err.to_string().contains("#4"));
        assert_eq!(CoreError::ShuttingDown.error_kind(), ErrorKind::ServerShuttingDown);
    }

    #[test]
    fn test_host_error() {
        let err = HostError::Fatal("widget tree corrupted".into());
        assert!(err.is_fatal());
        assert_eq!(err.message(), "widget tree corrupted");
        assert!(!HostError::Rejected("no such widget".into()).is_fatal());
    }
}

//! Protocol error types and error kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or request decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'HBR1', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    /// A complete frame was read but its content is not a valid request.
    ///
    /// `id` holds the caller's request id when it could be recovered, so the
    /// error response can still be correlated.
    #[error("malformed request: {reason}")]
    Malformed { id: Option<Value>, reason: String },
}

impl ProtocolError {
    pub fn malformed(id: Option<Value>, reason: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            id,
            reason: reason.into(),
        }
    }

    /// Returns whether the byte stream can no longer be trusted after this error.
    ///
    /// Header-level errors leave the reader misaligned, and a checksum
    /// failure means the length prefix itself may be corrupt.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidMagic(_)
                | ProtocolError::UnsupportedVersion(_)
                | ProtocolError::FrameTooLarge { .. }
                | ProtocolError::CrcMismatch { .. }
                | ProtocolError::InvalidFlags(_)
                | ProtocolError::Io(_)
        )
    }

    /// Returns the caller's request id, if this error carries one.
    pub fn request_id(&self) -> Option<&Value> {
        match self {
            ProtocolError::Malformed { id, .. } => id.as_ref(),
            _ => None,
        }
    }
}

/// Stable error kinds returned in failure responses.
///
/// These names are part of the protocol contract and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Frame or payload could not be decoded, or failed schema validation.
    MalformedRequest,
    /// The command kind is not known to this server.
    UnsupportedCommand,
    /// A host capability raised a fault while executing the command.
    HostExecutionError,
    /// A reload was requested while another one is still active.
    ReloadAlreadyInProgress,
    /// The host reported a failed or cancelled reload.
    ReloadFailed,
    /// The host never reported the end of a reload.
    ReloadTimeout,
    /// The command queue is saturated.
    ServerBusy,
    /// No result was produced before the request deadline.
    RequestTimeout,
    /// A request id collided with one still pending.
    DuplicateRequestId,
    /// The server is stopping; pending work will not be answered.
    ServerShuttingDown,
}

impl ErrorKind {
    /// Returns whether the caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ServerBusy | ErrorKind::RequestTimeout | ErrorKind::ReloadAlreadyInProgress
        )
    }

    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedRequest => "MalformedRequest",
            ErrorKind::UnsupportedCommand => "UnsupportedCommand",
            ErrorKind::HostExecutionError => "HostExecutionError",
            ErrorKind::ReloadAlreadyInProgress => "ReloadAlreadyInProgress",
            ErrorKind::ReloadFailed => "ReloadFailed",
            ErrorKind::ReloadTimeout => "ReloadTimeout",
            ErrorKind::ServerBusy => "ServerBusy",
            ErrorKind::RequestTimeout => "RequestTimeout",
            ErrorKind::DuplicateRequestId => "DuplicateRequestId",
            ErrorKind::ServerShuttingDown => "ServerShuttingDown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_retryable() {
        assert!(ErrorKind::ServerBusy.is_retryable());
        assert!(ErrorKind::RequestTimeout.is_retryable());
        assert!(ErrorKind::ReloadAlreadyInProgress.is_retryable());

        assert!(!ErrorKind::MalformedRequest.is_retryable());
        assert!(!ErrorKind::UnsupportedCommand.is_retryable());
        assert!(!ErrorKind::HostExecutionError.is_retryable());
        assert!(!ErrorKind::ReloadFailed.is_retryable());
        assert!(!ErrorKind::ServerShuttingDown.is_retryable());
    }

    #[test]
    fn test_error_kind_display_matches_serde() {
        for kind in [
            ErrorKind::MalformedRequest,
            ErrorKind::UnsupportedCommand,
            ErrorKind::HostExecutionError,
            ErrorKind::ReloadAlreadyInProgress,
            ErrorKind::ReloadFailed,
            ErrorKind::ReloadTimeout,
            ErrorKind::ServerBusy,
            ErrorKind::RequestTimeout,
            ErrorKind::DuplicateRequestId,
            ErrorKind::ServerShuttingDown,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_error_kind_deserialization() {
        let parsed: ErrorKind = serde_json::from_str("\"ServerBusy\"").unwrap();
        assert_eq!(parsed, ErrorKind::ServerBusy);
    }

    #[test]
    fn test_stream_fatal_classification() {
        assert!(ProtocolError::InvalidMagic(*b"XXXX").is_stream_fatal());
        assert!(ProtocolError::UnsupportedVersion(9).is_stream_fatal());
        assert!(ProtocolError::FrameTooLarge { size: 2, max: 1 }.is_stream_fatal());
        assert!(ProtocolError::CrcMismatch {
            expected: 1,
            actual: 2
        }
        .is_stream_fatal());

        // The frame was consumed, the next one is still readable
        assert!(!ProtocolError::InvalidUtf8.is_stream_fatal());
        assert!(!ProtocolError::malformed(None, "missing kind").is_stream_fatal());
    }

    #[test]
    fn test_malformed_keeps_request_id() {
        let err = ProtocolError::malformed(Some(Value::from(7)), "missing field `kind`");
        assert_eq!(err.request_id(), Some(&Value::from(7)));
        assert!(err.to_string().contains("kind"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.request_id().is_none());
    }
}

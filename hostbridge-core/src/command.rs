//! Commands, request ids and results.

use chrono::{DateTime, Utc};
use hostbridge_protocol::{CommandKind, CommandPayload, ErrorKind, ParsedRequest, Response};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identifier assigned to every decoded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic request id source. Ids are never reused.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded, host-bound unit of work.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: RequestId,
    /// Wire id supplied by the peer.
    pub client_id: Value,
    pub kind: CommandKind,
    pub payload: CommandPayload,
    pub received_at: DateTime<Utc>,
}

impl Command {
    pub fn new(id: RequestId, request: ParsedRequest) -> Self {
        Self {
            id,
            client_id: request.id,
            kind: request.kind,
            payload: request.payload,
            received_at: Utc::now(),
        }
    }
}

/// Outcome of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure { kind: ErrorKind, message: String },
}

impl Outcome {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Outcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Builds the wire response for the peer that sent `client_id`.
    pub fn into_response(self, client_id: Value) -> Response {
        match self {
            Outcome::Success(value) => Response::success(client_id, value),
            Outcome::Failure { kind, message } => Response::failure(client_id, kind, message),
        }
    }
}

/// The result produced for one request id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub id: RequestId,
    pub outcome: Outcome,
}

impl CommandResult {
    pub fn success(id: RequestId, value: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Success(value),
        }
    }

    pub fn failure(id: RequestId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::failure(kind, message),
        }
    }
}

//! JSON message types for requests and responses.

use crate::error::{ErrorKind, ProtocolError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Command kinds understood by the server.
///
/// Unknown names are preserved so they can be answered with
/// `UnsupportedCommand` instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandKind {
    // Host-bound
    ApplyMutation,
    QueryState,
    TriggerReload,
    ReloadStatus,

    // Answered by the network side
    Ping,
    Info,

    Unknown(String),
}

impl CommandKind {
    pub fn as_str(&self) -> &str {
        match self {
            CommandKind::ApplyMutation => "ApplyMutation",
            CommandKind::QueryState => "QueryState",
            CommandKind::TriggerReload => "TriggerReload",
            CommandKind::ReloadStatus => "ReloadStatus",
            CommandKind::Ping => "Ping",
            CommandKind::Info => "Info",
            CommandKind::Unknown(name) => name,
        }
    }

    /// Label used for metrics, collapsing unknown names into one bucket.
    pub fn metric_label(&self) -> &'static str {
        match self {
            CommandKind::ApplyMutation => "ApplyMutation",
            CommandKind::QueryState => "QueryState",
            CommandKind::TriggerReload => "TriggerReload",
            CommandKind::ReloadStatus => "ReloadStatus",
            CommandKind::Ping => "Ping",
            CommandKind::Info => "Info",
            CommandKind::Unknown(_) => "Unknown",
        }
    }

    /// All known kinds, as advertised by `Info`.
    pub fn known() -> [CommandKind; 6] {
        [
            CommandKind::ApplyMutation,
            CommandKind::QueryState,
            CommandKind::TriggerReload,
            CommandKind::ReloadStatus,
            CommandKind::Ping,
            CommandKind::Info,
        ]
    }
}

impl From<&str> for CommandKind {
    fn from(name: &str) -> Self {
        match name {
            "ApplyMutation" => CommandKind::ApplyMutation,
            "QueryState" => CommandKind::QueryState,
            "TriggerReload" => CommandKind::TriggerReload,
            "ReloadStatus" => CommandKind::ReloadStatus,
            "Ping" => CommandKind::Ping,
            "Info" => CommandKind::Info,
            other => CommandKind::Unknown(other.to_string()),
        }
    }
}

impl From<String> for CommandKind {
    fn from(name: String) -> Self {
        CommandKind::from(name.as_str())
    }
}

impl From<CommandKind> for String {
    fn from(kind: CommandKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-chosen correlation id (string or number), echoed in the response.
    pub id: Value,

    pub kind: CommandKind,

    /// Kind-specific payload.
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Request {
    pub fn new(id: impl Into<Value>, kind: CommandKind) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: empty_object(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Validates a decoded JSON document as a request envelope.
    ///
    /// The id is recovered first so later failures can still echo it.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            _ => return Err(ProtocolError::malformed(None, "request must be a JSON object")),
        };

        let id = match obj.remove("id") {
            Some(id @ (Value::String(_) | Value::Number(_))) => id,
            Some(_) => {
                return Err(ProtocolError::malformed(
                    None,
                    "field `id` must be a string or number",
                ))
            }
            None => return Err(ProtocolError::malformed(None, "missing field `id`")),
        };

        let kind = match obj.remove("kind") {
            Some(Value::String(kind)) if !kind.is_empty() => CommandKind::from(kind),
            Some(_) => {
                return Err(ProtocolError::malformed(
                    Some(id),
                    "field `kind` must be a non-empty string",
                ))
            }
            None => return Err(ProtocolError::malformed(Some(id), "missing field `kind`")),
        };

        let payload = match obj.remove("payload") {
            None | Some(Value::Null) => empty_object(),
            Some(payload) => payload,
        };

        Ok(Self { id, kind, payload })
    }

    /// Validates the payload against the schema of the declared kind.
    pub fn parse(self) -> Result<ParsedRequest, ProtocolError> {
        let payload = match &self.kind {
            CommandKind::ApplyMutation => {
                let descriptor: MutationDescriptor = typed_payload(&self.id, &self.payload)?;
                if descriptor.target.is_empty() || descriptor.action.is_empty() {
                    return Err(ProtocolError::malformed(
                        Some(self.id),
                        "mutation `target` and `action` must be non-empty",
                    ));
                }
                CommandPayload::Mutation(descriptor)
            }
            CommandKind::QueryState => {
                CommandPayload::Query(typed_payload(&self.id, &self.payload)?)
            }
            CommandKind::TriggerReload => {
                CommandPayload::Reload(typed_payload(&self.id, &self.payload)?)
            }
            CommandKind::ReloadStatus | CommandKind::Ping | CommandKind::Info => {
                CommandPayload::Empty
            }
            CommandKind::Unknown(_) => CommandPayload::Raw(self.payload),
        };

        Ok(ParsedRequest {
            id: self.id,
            kind: self.kind,
            payload,
        })
    }
}

fn typed_payload<T: DeserializeOwned>(id: &Value, payload: &Value) -> Result<T, ProtocolError> {
    T::deserialize(payload).map_err(|e| {
        ProtocolError::malformed(Some(id.clone()), format!("invalid payload: {}", e))
    })
}

/// A request whose payload matched its kind's schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub id: Value,
    pub kind: CommandKind,
    pub payload: CommandPayload,
}

/// Typed command payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    Mutation(MutationDescriptor),
    Query(StateQuery),
    Reload(ReloadRequest),
    Empty,
    /// Payload of an unknown kind, kept for diagnostics.
    Raw(Value),
}

/// Payload of `ApplyMutation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationDescriptor {
    /// Path of the object to mutate.
    pub target: String,
    /// Host-defined action name.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

/// Payload of `QueryState`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateQuery {
    /// Path to query; the whole state when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Payload of `TriggerReload`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReloadRequest {}

/// Error details in a failure response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ResponseError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Response message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Wire id of the originating request, or null when it could not be read.
    #[serde(default)]
    pub id: Value,

    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn success(id: Value, value: Value) -> Self {
        Self {
            id,
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(id: Value, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            value: None,
            error: Some(ResponseError::new(kind, message)),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

// ============================================================================
// Result types
// ============================================================================

/// Result for `Info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResult {
    pub server_name: String,
    pub server_version: String,
    pub protocol_version: u16,
    pub commands: Vec<String>,
    pub max_frame_bytes: u32,
}

/// How a reload ended, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReloadResult {
    Success,
    NoChanges,
    Failure,
    Cancelled,
}

impl ReloadResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ReloadResult::Success | ReloadResult::NoChanges)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadResult::Success => "Success",
            ReloadResult::NoChanges => "NoChanges",
            ReloadResult::Failure => "Failure",
            ReloadResult::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ReloadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log verbosity of a captured diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Verbosity {
    Fatal,
    Error,
    Warning,
    Display,
    Log,
}

/// A log line captured while a reload was running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub time_utc: DateTime<Utc>,
    pub category: String,
    pub verbosity: Verbosity,
    pub message: String,
}

impl DiagnosticEntry {
    pub fn new(category: impl Into<String>, verbosity: Verbosity, message: impl Into<String>) -> Self {
        Self {
            time_utc: Utc::now(),
            category: category.into(),
            verbosity,
            message: message.into(),
        }
    }
}

/// Result for a successful `TriggerReload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadSummary {
    pub result: ReloadResult,
    /// False when the host found nothing to recompile.
    pub changes: bool,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub diagnostics: Vec<DiagnosticEntry>,
}

/// Result for `ReloadStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadStatusResult {
    pub state: String,
    pub in_progress: bool,
    pub has_previous_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<ReloadResult>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub diagnostics: Vec<DiagnosticEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = Request::new(1, CommandKind::QueryState).with_payload(json!({"target": "root"}));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            json!({"id": 1, "kind": "QueryState", "payload": {"target": "root"}})
        );
    }

    #[test]
    fn test_unknown_kind_is_preserved() {
        let req: Request = serde_json::from_value(json!({"id": "a", "kind": "Teleport"})).unwrap();
        assert_eq!(req.kind, CommandKind::Unknown("Teleport".into()));
        assert_eq!(req.payload, json!({}));

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["kind"], "Teleport");
        assert_eq!(req.kind.metric_label(), "Unknown");
    }

    #[test]
    fn test_from_value_missing_kind_keeps_id() {
        let err = Request::from_value(json!({"id": "req-9", "payload": {}})).unwrap_err();
        assert_eq!(err.request_id(), Some(&json!("req-9")));
    }

    #[test]
    fn test_from_value_bad_id() {
        let err = Request::from_value(json!({"id": [1], "kind": "Ping"})).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { id: None, .. }));

        let err = Request::from_value(json!("just a string")).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { id: None, .. }));
    }

    #[test]
    fn test_from_value_ignores_unknown_fields() {
        let req =
            Request::from_value(json!({"id": 3, "kind": "Ping", "trace": "x", "payload": null}))
                .unwrap();
        assert_eq!(req.kind, CommandKind::Ping);
        assert_eq!(req.payload, json!({}));
    }

    #[test]
    fn test_parse_mutation() {
        let parsed = Request::new(1, CommandKind::ApplyMutation)
            .with_payload(json!({"target": "w/1", "action": "set", "args": {"text": "hi"}}))
            .parse()
            .unwrap();
        match parsed.payload {
            CommandPayload::Mutation(m) => {
                assert_eq!(m.target, "w/1");
                assert_eq!(m.action, "set");
                assert_eq!(m.args, Some(json!({"text": "hi"})));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_parse_mutation_schema_violation() {
        let err = Request::new("m", CommandKind::ApplyMutation)
            .with_payload(json!({"target": 5, "action": "set"}))
            .parse()
            .unwrap_err();
        assert_eq!(err.request_id(), Some(&json!("m")));

        let err = Request::new("m", CommandKind::ApplyMutation)
            .with_payload(json!({"target": "w", "action": ""}))
            .parse()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_parse_reload_payloads() {
        let parsed = Request::new(1, CommandKind::TriggerReload)
            .with_payload(json!({"reason": "ignored"}))
            .parse()
            .unwrap();
        assert_eq!(parsed.payload, CommandPayload::Reload(ReloadRequest {}));

        let err = Request::new(1, CommandKind::TriggerReload)
            .with_payload(json!(42))
            .parse()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_parse_query_without_target() {
        let parsed = Request::new(1, CommandKind::QueryState).parse().unwrap();
        assert_eq!(parsed.payload, CommandPayload::Query(StateQuery { target: None }));
    }

    #[test]
    fn test_response_success_serialization() {
        let resp = Response::success(json!(1), json!({"pong": true}));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json, json!({"id": 1, "ok": true, "value": {"pong": true}}));
    }

    #[test]
    fn test_response_failure_serialization() {
        let resp = Response::failure(json!("r"), ErrorKind::ServerBusy, "queue full");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            json!({"id": "r", "ok": false, "error": {"kind": "ServerBusy", "message": "queue full"}})
        );
        assert_eq!(resp.error_kind(), Some(ErrorKind::ServerBusy));
    }

    #[test]
    fn test_response_null_id() {
        let resp = Response::failure(Value::Null, ErrorKind::MalformedRequest, "bad frame");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.starts_with(r#"{"id":null"#));
    }

    #[test]
    fn test_reload_result_success_classes() {
        assert!(ReloadResult::Success.is_success());
        assert!(ReloadResult::NoChanges.is_success());
        assert!(!ReloadResult::Failure.is_success());
        assert!(!ReloadResult::Cancelled.is_success());
    }
}

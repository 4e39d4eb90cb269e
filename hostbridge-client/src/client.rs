//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use hostbridge_protocol::{CommandKind, InfoResult, ReloadStatusResult, ReloadSummary, Response};
use serde_json::{json, Value};
use std::sync::Arc;

/// High-level client for hostbridge.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection (for background read loop).
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    async fn request(&self, kind: CommandKind, payload: Value) -> Result<Value, ClientError> {
        into_result(self.conn.request(kind, payload).await?)
    }

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(CommandKind::Ping, json!({})).await?;
        Ok(())
    }

    /// Gets server info.
    pub async fn info(&self) -> Result<InfoResult, ClientError> {
        let result = self.request(CommandKind::Info, json!({})).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Reads host state, optionally narrowed to `target`.
    pub async fn query_state(&self, target: Option<&str>) -> Result<Value, ClientError> {
        let payload = match target {
            Some(target) => json!({ "target": target }),
            None => json!({}),
        };
        self.request(CommandKind::QueryState, payload).await
    }

    /// Applies a mutation on the host.
    pub async fn apply_mutation(
        &self,
        target: &str,
        action: &str,
        args: Option<Value>,
    ) -> Result<Value, ClientError> {
        let mut payload = json!({
            "target": target,
            "action": action,
        });
        if let Some(args) = args {
            payload["args"] = args;
        }
        self.request(CommandKind::ApplyMutation, payload).await
    }

    /// Triggers a reload and waits until the host reports its end.
    pub async fn trigger_reload(&self) -> Result<ReloadSummary, ClientError> {
        let result = self.request(CommandKind::TriggerReload, json!({})).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Gets the state of the current or last reload.
    pub async fn reload_status(&self) -> Result<ReloadStatusResult, ClientError> {
        let result = self.request(CommandKind::ReloadStatus, json!({})).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Sends an arbitrary command kind and returns the raw response.
    pub async fn raw(&self, kind: &str, payload: Value) -> Result<Response, ClientError> {
        self.conn.request(CommandKind::from(kind), payload).await
    }
}

fn into_result(response: Response) -> Result<Value, ClientError> {
    match response.error {
        Some(err) => Err(ClientError::Server {
            kind: err.kind,
            message: err.message,
        }),
        None => Ok(response.value.unwrap_or(Value::Null)),
    }
}

//! Registry of requests awaiting a result.
//!
//! Every command that reaches the queue has an entry here. The entry is
//! removed by whichever completion arrives first: the dispatcher's result,
//! the reload bridge, the deadline sweep or shutdown. Later completions for
//! the same id are logged and dropped, so each request is answered once.

use crate::command::{CommandResult, Outcome, RequestId};
use crate::error::CoreError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hostbridge_protocol::{CommandKind, ErrorKind, Response};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;

/// Identifies one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write side of a connection. Responses are written in send order.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Response>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Response>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a response for the writer. Returns false if the writer is gone.
    pub fn send(&self, response: Response) -> bool {
        self.tx.send(response).is_ok()
    }
}

/// A request that has not been answered yet.
#[derive(Debug)]
pub struct PendingEntry {
    pub id: RequestId,
    pub client_id: Value,
    pub kind: CommandKind,
    /// `None` once the originating connection has closed.
    pub connection: Option<ConnectionHandle>,
    pub submitted_at: Instant,
    pub deadline: Instant,
}

impl PendingEntry {
    pub fn new(
        id: RequestId,
        client_id: Value,
        kind: CommandKind,
        connection: Option<ConnectionHandle>,
        deadline: Instant,
    ) -> Self {
        Self {
            id,
            client_id,
            kind,
            connection,
            submitted_at: Instant::now(),
            deadline,
        }
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(|c| c.id())
    }
}

/// What happened to a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The response was queued on the originating connection.
    Delivered,
    /// The request was answered but its connection is gone.
    Discarded,
    /// No pending entry matched; the request was already answered.
    LateOrDuplicate,
}

/// Table of pending requests keyed by [`RequestId`].
pub struct Registry {
    entries: DashMap<RequestId, PendingEntry>,
    closed: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Adds a pending entry.
    pub fn register(&self, entry: PendingEntry) -> Result<(), CoreError> {
        if self.is_closed() {
            return Err(CoreError::ShuttingDown);
        }

        let id = entry.id;
        match self.entries.entry(id) {
            Entry::Occupied(_) => return Err(CoreError::DuplicateRequestId { id }),
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }

        // close_all may have drained the table between the check and the insert
        if self.is_closed() && self.entries.remove(&id).is_some() {
            return Err(CoreError::ShuttingDown);
        }

        Ok(())
    }

    /// Routes a result to its connection and removes the entry.
    pub fn complete(&self, result: CommandResult) -> Completion {
        let Some((_, entry)) = self.entries.remove(&result.id) else {
            tracing::debug!(
                "LateOrDuplicateResult: no pending request {} ({:?})",
                result.id,
                result.outcome.error_kind()
            );
            return Completion::LateOrDuplicate;
        };

        deliver(entry, result.outcome)
    }

    /// Detaches every entry of a closed connection.
    ///
    /// The entries stay pending so host work still completes; only the
    /// write is suppressed. Returns the number of entries detached.
    pub fn detach_connection(&self, conn: ConnectionId) -> usize {
        let mut detached = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.connection_id() == Some(conn) {
                entry.connection = None;
                detached += 1;
            }
        }
        if detached > 0 {
            tracing::debug!("Detached {} pending requests from {}", detached, conn);
        }
        detached
    }

    /// Answers every entry whose deadline is at or before `now` with
    /// `RequestTimeout`. Returns the evicted ids.
    pub fn sweep(&self, now: Instant) -> Vec<RequestId> {
        let expired: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| *e.key())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some((_, entry)) = self.entries.remove_if(&id, |_, e| e.deadline <= now) {
                tracing::warn!(
                    "Request {} ({}) timed out after {:?}",
                    id,
                    entry.kind,
                    now.saturating_duration_since(entry.submitted_at)
                );
                deliver(
                    entry,
                    Outcome::failure(ErrorKind::RequestTimeout, "no result before deadline"),
                );
                evicted.push(id);
            }
        }
        evicted
    }

    /// Closes the registry and answers every pending entry with `kind`.
    pub fn close_all(&self, kind: ErrorKind, message: &str) -> usize {
        self.closed.store(true, Ordering::Release);

        let ids: Vec<RequestId> = self.entries.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                deliver(entry, Outcome::failure(kind, message));
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::info!("Answered {} pending requests with {}", closed, kind);
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of pending entries owned by `conn`.
    pub fn pending_for(&self, conn: ConnectionId) -> usize {
        self.entries
            .iter()
            .filter(|e| e.connection_id() == Some(conn))
            .count()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(entry: PendingEntry, outcome: Outcome) -> Completion {
    let response = outcome.into_response(entry.client_id);
    if let Some(conn) = entry.connection {
        if conn.send(response) {
            return Completion::Delivered;
        }
    }
    tracing::debug!("Result for {} discarded, connection closed", entry.id);
    Completion::Discarded
}

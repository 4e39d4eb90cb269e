//! Network-side entry point: registers a request and queues its command.

use crate::command::{Command, CommandResult, RequestId, RequestIdGenerator};
use crate::queue::CommandSender;
use crate::registry::{ConnectionHandle, PendingEntry, Registry};
use hostbridge_protocol::{CommandKind, ErrorKind, ParsedRequest, Response};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of [`CommandIntake::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Queued for the next host tick.
    Queued(RequestId),
    /// Refused; the failure response has already been sent.
    Rejected(ErrorKind),
}

/// Shared by all connections.
pub struct CommandIntake {
    ids: RequestIdGenerator,
    registry: Arc<Registry>,
    queue: CommandSender,
    command_timeout: Duration,
    reload_timeout: Duration,
}

impl CommandIntake {
    pub fn new(
        registry: Arc<Registry>,
        queue: CommandSender,
        command_timeout: Duration,
        reload_timeout: Duration,
    ) -> Self {
        Self {
            ids: RequestIdGenerator::new(),
            registry,
            queue,
            command_timeout,
            reload_timeout,
        }
    }

    /// Registers `request` and queues it for the host.
    ///
    /// The entry is registered before the command is queued, so the
    /// dispatcher can never produce a result nobody is waiting for.
    pub fn submit(&self, request: ParsedRequest, conn: Option<ConnectionHandle>) -> Submission {
        let id = self.ids.next_id();
        let deadline = Instant::now() + self.deadline_for(&request.kind);
        let entry = PendingEntry::new(
            id,
            request.id.clone(),
            request.kind.clone(),
            conn.clone(),
            deadline,
        );

        if let Err(e) = self.registry.register(entry) {
            let kind = e.error_kind();
            if let Some(conn) = conn {
                conn.send(Response::failure(request.id, kind, e.to_string()));
            }
            return Submission::Rejected(kind);
        }

        match self.queue.try_enqueue(Command::new(id, request)) {
            Ok(()) => {
                tracing::trace!("Queued {} (depth {})", id, self.queue.depth());
                Submission::Queued(id)
            }
            Err(e) => {
                let kind = e.error_kind();
                let message = match kind {
                    ErrorKind::ServerBusy => format!(
                        "command queue is full ({} pending)",
                        self.queue.capacity()
                    ),
                    _ => e.to_string(),
                };
                tracing::warn!("Rejected {}: {}", id, message);
                self.registry
                    .complete(CommandResult::failure(id, kind, message));
                Submission::Rejected(kind)
            }
        }
    }

    /// Time a request of `kind` may stay pending.
    ///
    /// Reloads get the reload timeout on top, so the reload watchdog always
    /// fires before the generic sweep.
    pub fn deadline_for(&self, kind: &CommandKind) -> Duration {
        match kind {
            CommandKind::TriggerReload => self.reload_timeout + self.command_timeout,
            _ => self.command_timeout,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::command_queue;
    use crate::registry::ConnectionId;
    use hostbridge_protocol::{CommandPayload, StateQuery};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn query(id: u64) -> ParsedRequest {
        ParsedRequest {
            id: json!(id),
            kind: CommandKind::QueryState,
            payload: CommandPayload::Query(StateQuery::default()),
        }
    }

    #[test]
    fn test_submit_registers_and_queues() {
        let registry = Arc::new(Registry::new());
        let (sender, mut receiver) = command_queue(4);
        let intake = CommandIntake::new(
            registry.clone(),
            sender,
            Duration::from_secs(30),
            Duration::from_secs(300),
        );

        let Submission::Queued(id) = intake.submit(query(1), None) else {
            panic!("expected the command to be queued");
        };
        assert!(registry.contains(id));
        assert_eq!(intake.queue_depth(), 1);

        let cmd = receiver.try_dequeue().unwrap();
        assert_eq!(cmd.id, id);
        assert_eq!(cmd.client_id, json!(1));
    }

    #[test]
    fn test_same_wire_id_gets_distinct_request_ids() {
        let registry = Arc::new(Registry::new());
        let (sender, _receiver) = command_queue(4);
        let intake = CommandIntake::new(
            registry.clone(),
            sender,
            Duration::from_secs(30),
            Duration::from_secs(300),
        );

        let a = intake.submit(query(1), None);
        let b = intake.submit(query(1), None);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_full_queue_answers_server_busy() {
        let registry = Arc::new(Registry::new());
        let (sender, _receiver) = command_queue(1);
        let intake = CommandIntake::new(
            registry.clone(),
            sender,
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = ConnectionHandle::new(ConnectionId::new(1), tx);

        assert!(matches!(
            intake.submit(query(1), Some(conn.clone())),
            Submission::Queued(_)
        ));
        assert_eq!(
            intake.submit(query(2), Some(conn)),
            Submission::Rejected(ErrorKind::ServerBusy)
        );

        let resp = rx.try_recv().unwrap();
        assert_eq!(resp.id, json!(2));
        assert_eq!(resp.error_kind(), Some(ErrorKind::ServerBusy));
        // The rejected entry does not linger
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_closed_registry_answers_shutting_down() {
        let registry = Arc::new(Registry::new());
        let (sender, _receiver) = command_queue(4);
        let intake = CommandIntake::new(
            registry.clone(),
            sender,
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        registry.close_all(ErrorKind::ServerShuttingDown, "stopping");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = ConnectionHandle::new(ConnectionId::new(1), tx);
        assert_eq!(
            intake.submit(query(1), Some(conn)),
            Submission::Rejected(ErrorKind::ServerShuttingDown)
        );
        assert_eq!(
            rx.try_recv().unwrap().error_kind(),
            Some(ErrorKind::ServerShuttingDown)
        );
    }

    #[test]
    fn test_reload_deadline_outlives_watchdog() {
        let (sender, _receiver) = command_queue(1);
        let intake = CommandIntake::new(
            Arc::new(Registry::new()),
            sender,
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        assert_eq!(
            intake.deadline_for(&CommandKind::TriggerReload),
            Duration::from_secs(330)
        );
        assert_eq!(
            intake.deadline_for(&CommandKind::ApplyMutation),
            Duration::from_secs(30)
        );
    }
}

//! Host dispatcher.
//!
//! The only code that calls into the [`Host`]. It is owned by the host
//! thread and driven by [`HostDispatcher::tick`] once per host frame.

use crate::command::{Command, CommandResult, Outcome, RequestId};
use crate::error::HostError;
use crate::host::Host;
use crate::queue::CommandReceiver;
use crate::registry::{Completion, Registry};
use crate::reload::ReloadBridge;
use hostbridge_protocol::{CommandKind, CommandPayload, ErrorKind, StateQuery};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-tick limits.
#[derive(Debug, Clone, Copy)]
pub struct TickBudget {
    /// Maximum commands executed per tick.
    pub commands: usize,
    /// Time after which no further command is started.
    pub time: Duration,
}

impl Default for TickBudget {
    fn default() -> Self {
        Self {
            commands: 64,
            time: Duration::from_millis(8),
        }
    }
}

/// What happened to one command during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Success,
    Failure(ErrorKind),
    /// Waiting for the host to report reload completion.
    Parked,
}

#[derive(Debug, Clone)]
pub struct TickEntry {
    pub id: RequestId,
    pub kind: CommandKind,
    pub outcome: TickOutcome,
    pub duration: Duration,
}

/// Summary of one tick, fed into metrics by the host loop.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub entries: Vec<TickEntry>,
    /// Commands still queued after the tick.
    pub remaining: usize,
    pub elapsed: Duration,
    /// Results whose connection had closed.
    pub discarded: usize,
}

impl TickReport {
    pub fn executed(&self) -> usize {
        self.entries.len()
    }

    pub fn is_idle(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Drains the command queue on the host thread.
pub struct HostDispatcher {
    queue: CommandReceiver,
    registry: Arc<Registry>,
    reload: ReloadBridge,
    budget: TickBudget,
}

impl HostDispatcher {
    pub fn new(
        queue: CommandReceiver,
        registry: Arc<Registry>,
        reload: ReloadBridge,
        budget: TickBudget,
    ) -> Self {
        Self {
            queue,
            registry,
            reload,
            budget,
        }
    }

    /// Executes queued commands in arrival order until the queue is empty or
    /// a budget is spent, then hands the results to the registry.
    pub fn tick<H: Host>(&mut self, host: &mut H) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();
        let mut results = Vec::new();

        while report.entries.len() < self.budget.commands && started.elapsed() < self.budget.time
        {
            let Some(command) = self.queue.try_dequeue() else {
                break;
            };

            let id = command.id;
            let kind = command.kind.clone();
            let command_started = Instant::now();

            let outcome = match self.execute(host, command) {
                Some(result) => {
                    let outcome = match &result.outcome {
                        Outcome::Success(_) => TickOutcome::Success,
                        Outcome::Failure { kind, .. } => TickOutcome::Failure(*kind),
                    };
                    results.push(result);
                    outcome
                }
                None => TickOutcome::Parked,
            };

            report.entries.push(TickEntry {
                id,
                kind,
                outcome,
                duration: command_started.elapsed(),
            });
        }

        for result in results {
            if self.registry.complete(result) == Completion::Discarded {
                report.discarded += 1;
            }
        }

        report.remaining = self.queue.depth();
        report.elapsed = started.elapsed();
        if report.remaining > 0 && !report.is_idle() {
            tracing::debug!(
                "Tick budget spent after {} commands, {} still queued",
                report.executed(),
                report.remaining
            );
        }
        report
    }

    /// Stops accepting new commands.
    pub fn close(&mut self) {
        self.queue.close();
    }

    pub fn reload(&self) -> &ReloadBridge {
        &self.reload
    }

    /// Runs one command. Returns `None` when the result is deferred.
    fn execute<H: Host>(&mut self, host: &mut H, command: Command) -> Option<CommandResult> {
        let id = command.id;
        let outcome = match (&command.kind, command.payload) {
            (CommandKind::ApplyMutation, CommandPayload::Mutation(mutation)) => {
                guarded(id, &command.kind, || host.apply_mutation(&mutation))
            }
            (CommandKind::QueryState, CommandPayload::Query(query)) => {
                guarded(id, &command.kind, || host.query_state(&query))
            }
            (CommandKind::QueryState, _) => {
                guarded(id, &command.kind, || host.query_state(&StateQuery::default()))
            }
            (CommandKind::TriggerReload, _) => return self.trigger_reload(host, id),
            (CommandKind::ReloadStatus, _) => {
                Outcome::Success(serde_json::to_value(self.reload.status()).unwrap_or_default())
            }
            (CommandKind::Unknown(name), _) => Outcome::failure(
                ErrorKind::UnsupportedCommand,
                format!("unsupported command kind '{}'", name),
            ),
            (kind, _) => Outcome::failure(
                ErrorKind::UnsupportedCommand,
                format!("command kind '{}' is not executed by the host", kind),
            ),
        };

        Some(CommandResult { id, outcome })
    }

    fn trigger_reload<H: Host>(&mut self, host: &mut H, id: RequestId) -> Option<CommandResult> {
        if let Err(active) = self.reload.begin(id) {
            return Some(CommandResult::failure(
                id,
                ErrorKind::ReloadAlreadyInProgress,
                format!("a reload is already in progress (requested by {})", active),
            ));
        }

        match panic::catch_unwind(AssertUnwindSafe(|| host.start_reload())) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => self.reload.abort(id, e.message()),
            Err(payload) => self
                .reload
                .abort(id, &format!("host panicked: {}", panic_message(&*payload))),
        }
    }
}

/// Calls a host capability, turning errors and panics into failures.
fn guarded<F>(id: RequestId, kind: &CommandKind, call: F) -> Outcome
where
    F: FnOnce() -> Result<serde_json::Value, HostError>,
{
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Outcome::Success(value),
        Ok(Err(e)) => {
            if e.is_fatal() {
                tracing::error!("Host failed fatally executing {} {}: {}", kind, id, e);
            } else {
                tracing::debug!("Host rejected {} {}: {}", kind, id, e);
            }
            Outcome::failure(ErrorKind::HostExecutionError, e.message())
        }
        Err(payload) => {
            let message = panic_message(&*payload);
            tracing::error!("Host panicked executing {} {}: {}", kind, id, message);
            Outcome::failure(
                ErrorKind::HostExecutionError,
                format!("host panicked: {}", message),
            )
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::queue::{command_queue, CommandSender};
    use crate::registry::{ConnectionHandle, ConnectionId, PendingEntry};
    use crate::reload::ReloadOutcome;
    use chrono::Utc;
    use hostbridge_protocol::{MutationDescriptor, ReloadRequest, ReloadResult, Response};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingHost {
        log: Vec<String>,
        reloads: usize,
        refuse_reload: bool,
        mutation_delay: Option<Duration>,
    }

    impl Host for RecordingHost {
        fn apply_mutation(&mut self, m: &MutationDescriptor) -> Result<Value, HostError> {
            match m.action.as_str() {
                "fail" => Err(HostError::Rejected(format!("cannot touch {}", m.target))),
                "panic" => panic!("widget {} exploded", m.target),
                _ => {
                    if let Some(delay) = self.mutation_delay {
                        std::thread::sleep(delay);
                    }
                    self.log.push(format!("{}:{}", m.action, m.target));
                    Ok(json!({"target": m.target, "applied": m.action}))
                }
            }
        }

        fn query_state(&self, q: &StateQuery) -> Result<Value, HostError> {
            Ok(json!({"target": q.target, "log": self.log}))
        }

        fn start_reload(&mut self) -> Result<(), HostError> {
            if self.refuse_reload {
                return Err(HostError::Rejected("live coding disabled".into()));
            }
            self.reloads += 1;
            Ok(())
        }
    }

    struct Harness {
        sender: CommandSender,
        dispatcher: HostDispatcher,
        registry: Arc<Registry>,
        reload: ReloadBridge,
        conn: ConnectionHandle,
        rx: mpsc::UnboundedReceiver<Response>,
        next: u64,
    }

    impl Harness {
        fn new(budget: TickBudget) -> Self {
            let (sender, receiver) = command_queue(64);
            let registry = Arc::new(Registry::new());
            let reload = ReloadBridge::new(registry.clone(), Duration::from_secs(300));
            let dispatcher =
                HostDispatcher::new(receiver, registry.clone(), reload.clone(), budget);
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                sender,
                dispatcher,
                registry,
                reload,
                conn: ConnectionHandle::new(ConnectionId::new(1), tx),
                rx,
                next: 1,
            }
        }

        fn submit(&mut self, kind: CommandKind, payload: CommandPayload) -> RequestId {
            let id = RequestId::new(self.next);
            self.next += 1;
            self.registry
                .register(PendingEntry::new(
                    id,
                    json!(id.as_u64()),
                    kind.clone(),
                    Some(self.conn.clone()),
                    std::time::Instant::now() + Duration::from_secs(60),
                ))
                .unwrap();
            self.sender
                .try_enqueue(Command {
                    id,
                    client_id: json!(id.as_u64()),
                    kind,
                    payload,
                    received_at: Utc::now(),
                })
                .unwrap();
            id
        }

        fn mutate(&mut self, target: &str, action: &str) -> RequestId {
            self.submit(
                CommandKind::ApplyMutation,
                CommandPayload::Mutation(MutationDescriptor {
                    target: target.into(),
                    action: action.into(),
                    args: None,
                }),
            )
        }

        fn responses(&mut self) -> Vec<Response> {
            std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
        }
    }

    #[test]
    fn test_commands_run_in_queue_order() {
        let mut h = Harness::new(TickBudget::default());
        let mut host = RecordingHost::default();
        for n in 0..5 {
            h.mutate(&format!("w{}", n), "set");
        }

        let report = h.dispatcher.tick(&mut host);
        assert_eq!(report.executed(), 5);
        assert_eq!(report.remaining, 0);
        assert_eq!(host.log, vec!["set:w0", "set:w1", "set:w2", "set:w3", "set:w4"]);

        let ids: Vec<Value> = h.responses().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
    }

    #[test]
    fn test_command_budget_defers_without_reordering() {
        let mut h = Harness::new(TickBudget {
            commands: 2,
            time: Duration::from_secs(1),
        });
        let mut host = RecordingHost::default();
        for n in 0..5 {
            h.mutate(&format!("w{}", n), "set");
        }

        let first = h.dispatcher.tick(&mut host);
        assert_eq!(first.executed(), 2);
        assert_eq!(first.remaining, 3);

        h.dispatcher.tick(&mut host);
        h.dispatcher.tick(&mut host);
        assert_eq!(host.log, vec!["set:w0", "set:w1", "set:w2", "set:w3", "set:w4"]);
        assert!(h.dispatcher.tick(&mut host).is_idle());
    }

    #[test]
    fn test_time_budget_defers_without_reordering() {
        let mut h = Harness::new(TickBudget {
            commands: 64,
            time: Duration::from_millis(30),
        });
        let mut host = RecordingHost {
            mutation_delay: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        for n in 0..5 {
            h.mutate(&format!("w{}", n), "set");
        }

        let mut per_tick = Vec::new();
        while per_tick.iter().sum::<usize>() < 5 {
            let report = h.dispatcher.tick(&mut host);
            assert!((1..=2).contains(&report.executed()));
            assert_eq!(report.remaining, 5 - per_tick.iter().sum::<usize>() - report.executed());
            per_tick.push(report.executed());
        }

        assert!(per_tick.len() >= 3);
        assert_eq!(host.log, vec!["set:w0", "set:w1", "set:w2", "set:w3", "set:w4"]);
        let ids: Vec<Value> = h.responses().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
    }

    #[test]
    fn test_host_errors_and_panics_do_not_abort_tick() {
        let mut h = Harness::new(TickBudget::default());
        let mut host = RecordingHost::default();
        h.mutate("a", "fail");
        h.mutate("b", "panic");
        h.mutate("c", "set");

        let report = h.dispatcher.tick(&mut host);
        assert_eq!(
            report.entries.iter().map(|e| e.outcome).collect::<Vec<_>>(),
            vec![
                TickOutcome::Failure(ErrorKind::HostExecutionError),
                TickOutcome::Failure(ErrorKind::HostExecutionError),
                TickOutcome::Success,
            ]
        );

        let responses = h.responses();
        assert_eq!(responses.len(), 3);
        assert!(responses[1]
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("exploded"));
        assert!(responses[2].ok);
    }

    #[test]
    fn test_query_state_reads_host() {
        let mut h = Harness::new(TickBudget::default());
        let mut host = RecordingHost::default();
        h.mutate("w", "set");
        h.submit(
            CommandKind::QueryState,
            CommandPayload::Query(StateQuery {
                target: Some("w".into()),
            }),
        );

        h.dispatcher.tick(&mut host);
        let responses = h.responses();
        assert_eq!(responses[1].value.as_ref().unwrap()["log"], json!(["set:w"]));
    }

    #[test]
    fn test_unknown_kind_is_unsupported() {
        let mut h = Harness::new(TickBudget::default());
        let mut host = RecordingHost::default();
        h.submit(
            CommandKind::Unknown("Teleport".into()),
            CommandPayload::Raw(json!({})),
        );

        h.dispatcher.tick(&mut host);
        let responses = h.responses();
        assert_eq!(responses[0].error_kind(), Some(ErrorKind::UnsupportedCommand));
    }

    #[test]
    fn test_reload_is_parked_until_host_reports() {
        let mut h = Harness::new(TickBudget::default());
        let mut host = RecordingHost::default();
        let reload_id = h.submit(
            CommandKind::TriggerReload,
            CommandPayload::Reload(ReloadRequest {}),
        );
        h.mutate("w", "set");

        let report = h.dispatcher.tick(&mut host);
        assert_eq!(report.entries[0].outcome, TickOutcome::Parked);
        assert_eq!(host.reloads, 1);

        // Mutations keep executing while the reload runs
        let responses = h.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, json!(2));
        assert!(h.registry.contains(reload_id));

        h.reload
            .notifier()
            .reload_complete(ReloadOutcome::new(ReloadResult::Success));
        let responses = h.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, json!(reload_id.as_u64()));
        assert!(responses[0].ok);
    }

    #[test]
    fn test_concurrent_reload_is_rejected() {
        let mut h = Harness::new(TickBudget::default());
        let mut host = RecordingHost::default();
        h.submit(
            CommandKind::TriggerReload,
            CommandPayload::Reload(ReloadRequest {}),
        );
        h.submit(
            CommandKind::TriggerReload,
            CommandPayload::Reload(ReloadRequest {}),
        );

        h.dispatcher.tick(&mut host);
        assert_eq!(host.reloads, 1);

        let responses = h.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, json!(2));
        assert_eq!(
            responses[0].error_kind(),
            Some(ErrorKind::ReloadAlreadyInProgress)
        );
    }

    #[test]
    fn test_refused_reload_fails_immediately() {
        let mut h = Harness::new(TickBudget::default());
        let mut host = RecordingHost {
            refuse_reload: true,
            ..Default::default()
        };
        h.submit(
            CommandKind::TriggerReload,
            CommandPayload::Reload(ReloadRequest {}),
        );

        h.dispatcher.tick(&mut host);
        let responses = h.responses();
        assert_eq!(responses[0].error_kind(), Some(ErrorKind::ReloadFailed));
        assert!(!h.dispatcher.reload().is_active());
    }

    #[test]
    fn test_reload_status_snapshot() {
        let mut h = Harness::new(TickBudget::default());
        let mut host = RecordingHost::default();
        h.submit(
            CommandKind::TriggerReload,
            CommandPayload::Reload(ReloadRequest {}),
        );
        h.submit(CommandKind::ReloadStatus, CommandPayload::Empty);

        h.dispatcher.tick(&mut host);
        let responses = h.responses();
        let status = responses[0].value.as_ref().unwrap();
        assert_eq!(status["in_progress"], true);
        assert_eq!(status["state"], "Requested");
    }

    #[test]
    fn test_detached_results_are_counted() {
        let mut h = Harness::new(TickBudget::default());
        let mut host = RecordingHost::default();
        h.mutate("w", "set");
        h.registry.detach_connection(ConnectionId::new(1));

        let report = h.dispatcher.tick(&mut host);
        assert_eq!(report.discarded, 1);
        // The mutation still ran
        assert_eq!(host.log, vec!["set:w"]);
        assert!(h.responses().is_empty());
    }
}

//! Reload bridge.
//!
//! Tracks the single in-flight reload and turns the host's asynchronous
//! completion notification into the deferred result of the request that
//! triggered it.
//!
//! ```text
//! Idle --begin--> Requested --started--> InProgress --complete--> Idle
//!                     |                                  ^
//!                     +-------------complete-------------+
//! ```
//!
//! A session is also closed by the watchdog ([`ReloadBridge::check_timeout`])
//! or by a rejected start ([`ReloadBridge::abort`]). Whichever completion
//! comes first wins; later notifications are logged and ignored.

use crate::command::{CommandResult, Outcome, RequestId};
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use hostbridge_protocol::{
    DiagnosticEntry, ErrorKind, ReloadResult, ReloadStatusResult, ReloadSummary, Verbosity,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reload lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    Idle,
    Requested,
    InProgress,
    /// Outcome known; the result is being handed to the registry.
    Completed,
}

impl ReloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadState::Idle => "Idle",
            ReloadState::Requested => "Requested",
            ReloadState::InProgress => "InProgress",
            ReloadState::Completed => "Completed",
        }
    }
}

impl fmt::Display for ReloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the host says a reload ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ReloadOutcome {
    pub status: ReloadResult,
    /// Log lines captured while the reload ran.
    pub diagnostics: Vec<DiagnosticEntry>,
}

impl ReloadOutcome {
    pub fn new(status: ReloadResult) -> Self {
        Self {
            status,
            diagnostics: Vec::new(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<DiagnosticEntry>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

/// The last finished reload, kept for `ReloadStatus`.
#[derive(Debug, Clone)]
pub struct ReloadRecord {
    pub request: RequestId,
    pub result: ReloadResult,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub diagnostics: Vec<DiagnosticEntry>,
}

#[derive(Debug)]
struct ReloadSession {
    request: RequestId,
    state: ReloadState,
    started_at: DateTime<Utc>,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct BridgeState {
    session: Option<ReloadSession>,
    last: Option<ReloadRecord>,
}

struct Shared {
    state: Mutex<BridgeState>,
    registry: Arc<Registry>,
    timeout: Duration,
}

impl Shared {
    /// Closes the active session and records how it ended.
    ///
    /// Returns the triggering request and its outcome, or `None` when no
    /// session matched.
    fn finish(
        &self,
        only: Option<RequestId>,
        result: ReloadResult,
        diagnostics: Vec<DiagnosticEntry>,
        failure: Option<(ErrorKind, String)>,
    ) -> Option<CommandResult> {
        let mut state = self.state.lock();
        let matches = match &state.session {
            Some(s) => only.map_or(true, |id| id == s.request),
            None => false,
        };
        if !matches {
            return None;
        }
        let session = state.session.take()?;
        tracing::debug!(
            "Reload for {}: {} -> {}",
            session.request,
            session.state,
            ReloadState::Completed
        );

        let finished_at = Utc::now();
        let (outcome, message) = match failure {
            Some((kind, message)) => (Outcome::failure(kind, message.clone()), message),
            None if result.is_success() => {
                let summary = ReloadSummary {
                    result,
                    changes: result == ReloadResult::Success,
                    duration_ms: (finished_at - session.started_at)
                        .num_milliseconds()
                        .max(0) as u64,
                    started_at: session.started_at,
                    finished_at,
                    diagnostics: diagnostics.clone(),
                };
                let message = if summary.changes {
                    "Reload completed with changes".to_string()
                } else {
                    "Reload completed with no changes".to_string()
                };
                (
                    Outcome::Success(serde_json::to_value(&summary).unwrap_or_default()),
                    message,
                )
            }
            None => {
                let message = failure_message(result, &diagnostics);
                (
                    Outcome::failure(ErrorKind::ReloadFailed, message.clone()),
                    message,
                )
            }
        };

        state.last = Some(ReloadRecord {
            request: session.request,
            result,
            message,
            started_at: session.started_at,
            finished_at,
            diagnostics,
        });

        Some(CommandResult {
            id: session.request,
            outcome,
        })
    }
}

fn failure_message(result: ReloadResult, diagnostics: &[DiagnosticEntry]) -> String {
    if result == ReloadResult::Cancelled {
        return "Reload was cancelled".to_string();
    }
    let errors: Vec<&str> = diagnostics
        .iter()
        .filter(|d| d.verbosity <= Verbosity::Error)
        .map(|d| d.message.as_str())
        .collect();
    if errors.is_empty() {
        "Reload failed".to_string()
    } else {
        format!("Reload failed: {}", errors.join("\n"))
    }
}

/// Shared reload state machine. Cheap to clone.
#[derive(Clone)]
pub struct ReloadBridge {
    shared: Arc<Shared>,
}

impl ReloadBridge {
    /// Creates a bridge delivering deferred results through `registry`.
    pub fn new(registry: Arc<Registry>, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BridgeState::default()),
                registry,
                timeout,
            }),
        }
    }

    /// Returns a handle the host uses to report reload progress.
    pub fn notifier(&self) -> ReloadNotifier {
        ReloadNotifier {
            shared: self.shared.clone(),
        }
    }

    /// Opens a session for `request`.
    ///
    /// Fails with the id of the active session if one exists.
    pub fn begin(&self, request: RequestId) -> Result<(), RequestId> {
        let mut state = self.shared.state.lock();
        if let Some(active) = &state.session {
            return Err(active.request);
        }
        state.session = Some(ReloadSession {
            request,
            state: ReloadState::Requested,
            started_at: Utc::now(),
            deadline: Instant::now() + self.shared.timeout,
        });
        tracing::info!("Reload requested by {}", request);
        Ok(())
    }

    /// Closes the session of `request` after the host refused to start.
    pub fn abort(&self, request: RequestId, reason: &str) -> Option<CommandResult> {
        tracing::error!("Reload for {} could not start: {}", request, reason);
        self.shared.finish(
            Some(request),
            ReloadResult::Failure,
            Vec::new(),
            Some((ErrorKind::ReloadFailed, reason.to_string())),
        )
    }

    /// Fails the active session if it has outlived the reload timeout.
    ///
    /// Returns the request that timed out.
    pub fn check_timeout(&self, now: Instant) -> Option<RequestId> {
        let expired = {
            let state = self.shared.state.lock();
            match &state.session {
                Some(s) if s.deadline <= now => Some(s.request),
                _ => None,
            }
        };
        let request = expired?;

        tracing::warn!(
            "Reload for {} not reported within {:?}",
            request,
            self.shared.timeout
        );
        let result = self.shared.finish(
            Some(request),
            ReloadResult::Failure,
            Vec::new(),
            Some((
                ErrorKind::ReloadTimeout,
                format!(
                    "host did not report reload completion within {}s",
                    self.shared.timeout.as_secs()
                ),
            )),
        )?;
        self.shared.registry.complete(result);
        Some(request)
    }

    /// Returns to `Idle` once the result has been delivered; the previous
    /// outcome stays available through `last_record` and `status`.
    pub fn state(&self) -> ReloadState {
        self.shared
            .state
            .lock()
            .session
            .as_ref()
            .map_or(ReloadState::Idle, |s| s.state)
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.lock().session.is_some()
    }

    /// Request that owns the active session, if any.
    pub fn active_request(&self) -> Option<RequestId> {
        self.shared.state.lock().session.as_ref().map(|s| s.request)
    }

    pub fn last_record(&self) -> Option<ReloadRecord> {
        self.shared.state.lock().last.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Snapshot answered to `ReloadStatus`.
    pub fn status(&self) -> ReloadStatusResult {
        let state = self.shared.state.lock();
        let in_progress = state.session.is_some();
        let current = state
            .session
            .as_ref()
            .map_or(ReloadState::Idle, |s| s.state);

        let message = match (&state.session, &state.last) {
            (Some(_), _) => "Reload in progress".to_string(),
            (None, Some(last)) => last.message.clone(),
            (None, None) => "No reload has completed yet".to_string(),
        };

        ReloadStatusResult {
            state: current.as_str().to_string(),
            in_progress,
            has_previous_result: state.last.is_some(),
            last_result: state.last.as_ref().map(|r| r.result),
            message,
            timestamp_utc: state.last.as_ref().map(|r| r.finished_at),
            diagnostics: state
                .last
                .as_ref()
                .map(|r| r.diagnostics.clone())
                .unwrap_or_default(),
        }
    }
}

/// Handle through which the host reports reload progress from any thread.
#[derive(Clone)]
pub struct ReloadNotifier {
    shared: Arc<Shared>,
}

impl ReloadNotifier {
    /// Marks the requested reload as running.
    pub fn reload_started(&self) -> bool {
        let mut state = self.shared.state.lock();
        match state.session.as_mut() {
            Some(s) if s.state == ReloadState::Requested => {
                s.state = ReloadState::InProgress;
                tracing::debug!("Reload for {} in progress", s.request);
                true
            }
            Some(s) => {
                tracing::debug!("Duplicate reload start for {}", s.request);
                false
            }
            None => {
                tracing::warn!("Reload start reported with no active session");
                false
            }
        }
    }

    /// Reports the end of the reload and answers the triggering request.
    ///
    /// Returns false when no session was active.
    pub fn reload_complete(&self, outcome: ReloadOutcome) -> bool {
        let status = outcome.status;
        let Some(result) = self
            .shared
            .finish(None, status, outcome.diagnostics, None)
        else {
            tracing::warn!(
                "Reload completion ({}) with no active session, ignoring",
                status
            );
            return false;
        };

        match status {
            ReloadResult::Success => tracing::info!("Reload for {} completed with changes", result.id),
            ReloadResult::NoChanges => {
                tracing::info!("Reload for {} completed with no changes", result.id)
            }
            ReloadResult::Failure => tracing::error!("Reload for {} failed", result.id),
            ReloadResult::Cancelled => tracing::warn!("Reload for {} was cancelled", result.id),
        }

        self.shared.registry.complete(result);
        true
    }
}

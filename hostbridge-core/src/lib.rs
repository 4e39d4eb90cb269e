//! # hostbridge-core
//!
//! Bridge between the asynchronous network side and a single-threaded host.
//!
//! This crate provides:
//! - A bounded, non-blocking command queue
//! - The registry of pending requests with idempotent completion
//! - The host dispatcher, ticked from the host's own thread
//! - The reload bridge tracking the single in-flight reload

pub mod bridge;
pub mod command;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod intake;
pub mod queue;
pub mod registry;
pub mod reload;

pub use bridge::{Bridge, BridgeConfig};
pub use command::{Command, CommandResult, Outcome, RequestId, RequestIdGenerator};
pub use dispatcher::{HostDispatcher, TickBudget, TickEntry, TickOutcome, TickReport};
pub use error::{CoreError, HostError, QueueError};
pub use host::Host;
pub use intake::{CommandIntake, Submission};
pub use queue::{command_queue, CommandReceiver, CommandSender};
pub use registry::{Completion, ConnectionHandle, ConnectionId, PendingEntry, Registry};
pub use reload::{ReloadBridge, ReloadNotifier, ReloadOutcome, ReloadRecord, ReloadState};

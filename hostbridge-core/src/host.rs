//! Capabilities the embedding host exposes to the dispatcher.

use crate::error::HostError;
use hostbridge_protocol::{MutationDescriptor, StateQuery};
use serde_json::Value;

/// The embedding application.
///
/// Methods are only ever called from the host's own tick, through
/// [`HostDispatcher::tick`](crate::HostDispatcher::tick). Reload completion
/// is reported separately through a [`ReloadNotifier`](crate::ReloadNotifier)
/// handed to the host when it is constructed.
pub trait Host {
    /// Applies a mutation and returns the resulting state of the target.
    fn apply_mutation(&mut self, mutation: &MutationDescriptor) -> Result<Value, HostError>;

    /// Reads state without modifying it.
    fn query_state(&self, query: &StateQuery) -> Result<Value, HostError>;

    /// Starts a reload. Completion is reported asynchronously.
    fn start_reload(&mut self) -> Result<(), HostError>;
}

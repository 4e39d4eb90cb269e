//! Wires the queue, registry, reload bridge and dispatcher together.

use crate::dispatcher::{HostDispatcher, TickBudget};
use crate::intake::CommandIntake;
use crate::queue::command_queue;
use crate::registry::Registry;
use crate::reload::{ReloadBridge, ReloadNotifier};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub queue_capacity: usize,
    pub budget: TickBudget,
    pub command_timeout: Duration,
    pub reload_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            budget: TickBudget::default(),
            command_timeout: Duration::from_secs(30),
            reload_timeout: Duration::from_secs(300),
        }
    }
}

/// All parts of the bridge.
///
/// `dispatcher` goes to the host thread; everything else is shared with the
/// network side.
pub struct Bridge {
    pub intake: Arc<CommandIntake>,
    pub dispatcher: HostDispatcher,
    pub registry: Arc<Registry>,
    pub reload: ReloadBridge,
}

impl Bridge {
    pub fn new(config: &BridgeConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let (sender, receiver) = command_queue(config.queue_capacity);
        let reload = ReloadBridge::new(registry.clone(), config.reload_timeout);

        let intake = Arc::new(CommandIntake::new(
            registry.clone(),
            sender,
            config.command_timeout,
            config.reload_timeout,
        ));
        let dispatcher =
            HostDispatcher::new(receiver, registry.clone(), reload.clone(), config.budget);

        Self {
            intake,
            dispatcher,
            registry,
            reload,
        }
    }

    /// Handle to give the host for reload notifications.
    pub fn notifier(&self) -> ReloadNotifier {
        self.reload.notifier()
    }
}

//! Background deadline sweep and reload watchdog.

use crate::metrics::Metrics;
use hostbridge_core::{ReloadBridge, Registry};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Expires overdue requests and times out reloads the host never finished.
pub struct Sweeper {
    registry: Arc<Registry>,
    reload: ReloadBridge,
    interval: Duration,
    metrics: Option<Arc<Metrics>>,
    expired_total: AtomicU64,
    reload_timeouts: AtomicU64,
    shutdown: AtomicBool,
    notify: Notify,
}

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepResult {
    pub expired: usize,
    pub reload_timed_out: bool,
}

impl Sweeper {
    pub fn new(registry: Arc<Registry>, reload: ReloadBridge, interval: Duration) -> Self {
        Self {
            registry,
            reload,
            interval,
            metrics: None,
            expired_total: AtomicU64::new(0),
            reload_timeouts: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs one pass at `now`.
    ///
    /// The reload watchdog runs first so a stuck reload is reported as
    /// `ReloadTimeout` rather than a generic `RequestTimeout`.
    pub fn sweep_once(&self, now: Instant) -> SweepResult {
        let mut result = SweepResult::default();

        if let Some(id) = self.reload.check_timeout(now) {
            tracing::debug!("Watchdog closed reload {}", id);
            self.reload_timeouts.fetch_add(1, Ordering::Relaxed);
            result.reload_timed_out = true;
        }

        let expired = self.registry.sweep(now);
        if !expired.is_empty() {
            tracing::debug!("Expired {} overdue request(s)", expired.len());
            self.expired_total
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
        }
        result.expired = expired.len();

        if let Some(ref metrics) = self.metrics {
            metrics.pending_requests.set(self.registry.len() as f64);
        }

        result
    }

    /// Runs the sweep loop (call from a background task).
    pub async fn run(&self) {
        tracing::info!(
            "Deadline sweeper started (interval={:?}, reload watchdog={:?})",
            self.interval,
            self.reload.timeout()
        );

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            self.sweep_once(Instant::now());
        }

        tracing::info!("Deadline sweeper stopped");
    }

    /// Signals the loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn expired_total(&self) -> u64 {
        self.expired_total.load(Ordering::Relaxed)
    }

    pub fn reload_timeouts(&self) -> u64 {
        self.reload_timeouts.load(Ordering::Relaxed)
    }
}

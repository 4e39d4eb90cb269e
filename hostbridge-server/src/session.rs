//! Per-connection session state.

use hostbridge_core::ConnectionId;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A client session.
pub struct Session {
    /// Unique session ID, used in logs.
    pub id: String,

    /// Registry key for responses routed to this connection.
    pub conn_id: ConnectionId,

    /// Remote address.
    pub remote_addr: SocketAddr,

    /// Request counter.
    request_count: AtomicU64,

    /// Frames rejected as malformed.
    malformed_count: AtomicU64,

    created_at: Instant,

    last_activity: Mutex<Instant>,
}

impl Session {
    pub fn new(conn_id: ConnectionId, remote_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            conn_id,
            remote_addr,
            request_count: AtomicU64::new(0),
            malformed_count: AtomicU64::new(0),
            created_at: now,
            last_activity: Mutex::new(now),
        }
    }

    /// Records a decoded request and refreshes the idle timer.
    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_malformed(&self) {
        self.malformed_count.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed_count.load(Ordering::Relaxed)
    }

    /// Time since the last inbound frame.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("conn_id", &self.conn_id)
            .field("remote_addr", &self.remote_addr)
            .field("request_count", &self.request_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn test_session_counters() {
        let session = Session::new(ConnectionId::new(7), addr());
        assert_eq!(session.conn_id, ConnectionId::new(7));
        assert_eq!(session.request_count(), 0);

        session.record_request();
        session.record_request();
        session.record_malformed();

        assert_eq!(session.request_count(), 2);
        assert_eq!(session.malformed_count(), 1);
    }

    #[test]
    fn test_sessions_get_unique_ids() {
        let a = Session::new(ConnectionId::new(1), addr());
        let b = Session::new(ConnectionId::new(2), addr());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_touch_resets_idle() {
        let session = Session::new(ConnectionId::new(1), addr());
        std::thread::sleep(Duration::from_millis(20));
        assert!(session.idle_duration() >= Duration::from_millis(20));
        session.touch();
        assert!(session.idle_duration() < Duration::from_millis(20));
        assert!(session.age() >= Duration::from_millis(20));
    }
}

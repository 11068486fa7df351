//! Connection statistics tracking
//!
//! Counters only. There is no per-session registry; the active count is
//! what shutdown waits on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Atomic connection statistics
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total connections accepted
    total_accepted: AtomicU64,
    /// Currently active sessions
    active: AtomicU64,
    /// Sessions that reached the relay stage and finished
    completed: AtomicU64,
    /// Sessions that failed before or during setup
    errored: AtomicU64,
    /// Total bytes received (client -> upstream)
    bytes_rx: AtomicU64,
    /// Total bytes transmitted (upstream -> client)
    bytes_tx: AtomicU64,
    /// Woken when `active` drops to zero
    idle: Notify,
}

impl ConnectionStats {
    /// Create new connection statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new accepted connection and return its ticket.
    ///
    /// The ticket records an error if dropped without an outcome, so a
    /// panicking session is still accounted for.
    #[must_use]
    pub fn begin(self: &Arc<Self>) -> SessionTicket {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::AcqRel);
        SessionTicket {
            stats: Arc::clone(self),
            finished: false,
        }
    }

    fn finish(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Get total accepted connections
    #[must_use]
    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    /// Get currently active sessions
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    /// Get completed sessions
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Get errored sessions
    #[must_use]
    pub fn errored(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }

    /// Get total bytes received
    #[must_use]
    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    /// Get total bytes transmitted
    #[must_use]
    pub fn bytes_tx(&self) -> u64 {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    /// Wait until no session is active
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent finish is not missed
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_accepted: self.total_accepted(),
            active: self.active(),
            completed: self.completed(),
            errored: self.errored(),
            bytes_rx: self.bytes_rx(),
            bytes_tx: self.bytes_tx(),
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// Accounting handle for one accepted connection
#[derive(Debug)]
pub struct SessionTicket {
    stats: Arc<ConnectionStats>,
    finished: bool,
}

impl SessionTicket {
    /// Record a session that relayed and finished
    pub fn complete(mut self, bytes_rx: u64, bytes_tx: u64) {
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_rx.fetch_add(bytes_rx, Ordering::Relaxed);
        self.stats.bytes_tx.fetch_add(bytes_tx, Ordering::Relaxed);
        self.finished = true;
        self.stats.finish();
    }

    /// Record a session that failed
    pub fn fail(mut self) {
        self.stats.errored.fetch_add(1, Ordering::Relaxed);
        self.finished = true;
        self.stats.finish();
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        if !self.finished {
            self.stats.errored.fetch_add(1, Ordering::Relaxed);
            self.stats.finish();
        }
    }
}

/// Snapshot of connection statistics at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Total connections accepted
    pub total_accepted: u64,
    /// Currently active sessions
    pub active: u64,
    /// Completed sessions
    pub completed: u64,
    /// Errored sessions
    pub errored: u64,
    /// Total bytes received
    pub bytes_rx: u64,
    /// Total bytes transmitted
    pub bytes_tx: u64,
    /// Timestamp in milliseconds
    pub timestamp_ms: u64,
}

impl StatsSnapshot {
    /// Get total bytes transferred (both directions)
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.bytes_rx + self.bytes_tx
    }
}

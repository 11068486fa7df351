//! In-process NAT controller
//!
//! Records bindings instead of touching the kernel. Used by tests and for
//! running the proxy on hosts without nftables, where every user then
//! shares the default source address.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::NatController;
use crate::error::NatError;
use crate::identity::Mark;

/// NAT controller that keeps bindings in memory
#[derive(Debug, Default)]
pub struct MemoryNatController {
    bindings: Mutex<HashMap<Mark, Ipv6Addr>>,
    calls: AtomicUsize,
    /// Number of upcoming calls that should fail
    fail_next: AtomicUsize,
    /// Artificial latency per call
    delay: Option<Duration>,
}

impl MemoryNatController {
    /// Create an empty controller
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a controller that sleeps for `delay` inside every registration
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make the next `count` registrations fail
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Total registration calls, including failed ones
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Address currently bound to `mark`
    #[must_use]
    pub fn binding(&self, mark: Mark) -> Option<Ipv6Addr> {
        self.bindings.lock().get(&mark).copied()
    }

    /// Number of installed bindings
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    /// Whether no binding is installed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.lock().is_empty()
    }

    /// Drop all bindings, as a restart flush would
    pub fn flush(&self) {
        self.bindings.lock().clear();
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl NatController for MemoryNatController {
    async fn register_binding(&self, mark: Mark, address: Ipv6Addr) -> Result<(), NatError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_failure() {
            return Err(NatError::BindingRejected {
                mark,
                address,
                reason: "injected failure".into(),
            });
        }

        self.bindings.lock().insert(mark, address);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

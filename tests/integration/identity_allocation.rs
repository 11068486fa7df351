//! Identity allocator integration tests
//!
//! Concurrency properties of first use, exercised with many tasks on a
//! multi-threaded runtime.

use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use nat66_socks::error::{AllocationError, NatError};
use nat66_socks::identity::{derive_address, Mark};
use nat66_socks::nat::{MemoryNatController, NatController};

use super::allocator;

/// Tracks how many registrations overlap
#[derive(Default)]
struct OverlapNat {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl NatController for OverlapNat {
    async fn register_binding(&self, _mark: Mark, _address: Ipv6Addr) -> Result<(), NatError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "overlap"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_registers_once() {
    let nat = Arc::new(MemoryNatController::with_delay(Duration::from_millis(20)));
    let alloc = allocator(Arc::clone(&nat) as Arc<dyn NatController>);

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let alloc = Arc::clone(&alloc);
            tokio::spawn(async move { alloc.get_or_create_mark(b"alice").await.unwrap() })
        })
        .collect();

    let mut marks = HashSet::new();
    for task in tasks {
        marks.insert(task.await.unwrap());
    }

    assert_eq!(marks.len(), 1);
    assert_eq!(nat.calls(), 1);
    assert_eq!(alloc.len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_users_get_unique_marks() {
    let nat = Arc::new(OverlapNat::default());
    let alloc = allocator(Arc::clone(&nat) as Arc<dyn NatController>);

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let alloc = Arc::clone(&alloc);
            tokio::spawn(async move {
                let user = format!("user-{i}");
                (user.clone(), alloc.get_or_create_mark(user.as_bytes()).await.unwrap())
            })
        })
        .collect();

    let mut marks = HashSet::new();
    for task in tasks {
        let (_, mark) = task.await.unwrap();
        assert!(marks.insert(mark), "mark {mark} handed out twice");
    }

    // Marks are dense from 1
    let expected: HashSet<_> = (1..=50).map(Mark::new).collect();
    assert_eq!(marks, expected);
    assert_eq!(nat.calls.load(Ordering::SeqCst), 50);
    assert_eq!(nat.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bindings_match_derived_addresses() {
    let nat = Arc::new(MemoryNatController::new());
    let alloc = allocator(Arc::clone(&nat) as Arc<dyn NatController>);
    let prefix: Ipv6Addr = "2001:db8:1:2::".parse().unwrap();

    for user in ["alice", "bob", "carol"] {
        let mark = alloc.get_or_create_mark(user.as_bytes()).await.unwrap();
        assert_eq!(nat.binding(mark), Some(derive_address(prefix, user.as_bytes())));
    }

    assert_eq!(
        nat.binding(Mark::new(1)),
        Some("2001:db8:1:2:93af:71db:186d:6e90".parse().unwrap())
    );
}

#[tokio::test]
async fn test_failed_registration_retries_same_mark() {
    let nat = Arc::new(MemoryNatController::new());
    let alloc = allocator(Arc::clone(&nat) as Arc<dyn NatController>);

    alloc.get_or_create_mark(b"alice").await.unwrap();

    nat.fail_next(2);
    for _ in 0..2 {
        let err = alloc.get_or_create_mark(b"bob").await.unwrap_err();
        assert!(matches!(err, AllocationError::Registration { mark, .. } if mark == Mark::new(2)));
    }
    assert_eq!(alloc.lookup(b"bob").await, None);

    let mark = alloc.get_or_create_mark(b"bob").await.unwrap();
    assert_eq!(mark, Mark::new(2));
    assert_eq!(nat.calls(), 4);
}

//! Username to mark allocator
//!
//! The allocator owns the identity table and the mark counter. A single
//! async mutex covers lookup, derivation, NAT registration and commit, so:
//!
//! - at most one NAT registration is in flight at any time
//! - a mark is visible to callers only after its binding is registered
//! - a failed registration leaves table and counter untouched, and a retry
//!   tries the same mark again
//!
//! The table lives in memory only. Entries are never removed.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::prefix::Ipv6Prefix;
use super::Mark;
use crate::error::AllocationError;
use crate::nat::NatController;

/// Table state guarded by the allocator lock
#[derive(Debug)]
struct AllocatorState {
    marks: HashMap<Vec<u8>, Mark>,
    /// Mark for the next new user; `None` once the mark space is used up
    next_mark: Option<Mark>,
}

/// Binds usernames to marks and registers the bindings with NAT
pub struct IdentityAllocator {
    prefix: Ipv6Prefix,
    nat: Arc<dyn NatController>,
    state: Mutex<AllocatorState>,
}

impl IdentityAllocator {
    /// Create an allocator with an empty table.
    ///
    /// `nat` must already be initialised and reachable.
    pub fn new(prefix: Ipv6Prefix, nat: Arc<dyn NatController>) -> Self {
        Self {
            prefix,
            nat,
            state: Mutex::new(AllocatorState {
                marks: HashMap::with_capacity(1024),
                next_mark: Some(Mark::FIRST),
            }),
        }
    }

    /// Return the mark for `username`, allocating and registering one on
    /// first use.
    ///
    /// # Errors
    ///
    /// - `AllocationError::EmptyIdentity` for an empty username
    /// - `AllocationError::Registration` if the NAT controller rejected the
    ///   binding; nothing is committed in that case
    /// - `AllocationError::Exhausted` if no marks are left
    pub async fn get_or_create_mark(&self, username: &[u8]) -> Result<Mark, AllocationError> {
        if username.is_empty() {
            return Err(AllocationError::EmptyIdentity);
        }

        let mut state = self.state.lock().await;

        if let Some(&mark) = state.marks.get(username) {
            debug!(%mark, "Existing binding");
            return Ok(mark);
        }

        let mark = state.next_mark.ok_or(AllocationError::Exhausted)?;
        let address = self.prefix.derive(username);

        if let Err(source) = self.nat.register_binding(mark, address).await {
            warn!(
                user = %String::from_utf8_lossy(username),
                %mark,
                %address,
                error = %source,
                "NAT registration failed, binding not committed"
            );
            return Err(AllocationError::Registration {
                mark,
                address,
                source,
            });
        }

        state.marks.insert(username.to_vec(), mark);
        state.next_mark = mark.next();

        info!(
            user = %String::from_utf8_lossy(username),
            %address,
            %mark,
            backend = self.nat.name(),
            "New user bound"
        );
        Ok(mark)
    }

    /// Mark already assigned to `username`, without allocating
    pub async fn lookup(&self, username: &[u8]) -> Option<Mark> {
        self.state.lock().await.marks.get(username).copied()
    }

    /// Address a user is (or would be) translated to
    #[must_use]
    pub fn address_for(&self, username: &[u8]) -> Ipv6Addr {
        self.prefix.derive(username)
    }

    /// Mark the next new user would receive
    pub async fn next_mark(&self) -> Option<Mark> {
        self.state.lock().await.next_mark
    }

    /// Number of users in the table
    pub async fn len(&self) -> usize {
        self.state.lock().await.marks.len()
    }

    /// Whether the table is empty
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.marks.is_empty()
    }

    /// Configured prefix
    #[must_use]
    pub const fn prefix(&self) -> &Ipv6Prefix {
        &self.prefix
    }
}

impl std::fmt::Debug for IdentityAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityAllocator")
            .field("prefix", &self.prefix)
            .field("nat", &self.nat.name())
            .finish_non_exhaustive()
    }
}

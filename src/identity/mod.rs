//! Per-user identity binding
//!
//! Every authenticated username is bound to a connection mark and to an
//! IPv6 address derived from that username. The NAT controller turns the
//! pair into a source-NAT rule, so each user's outbound traffic leaves from
//! its own address.
//!
//! ```text
//! username --sha256--> address suffix ─┐
//!                                      ├─> (mark, address) --> NatController
//! allocator counter ---------> mark ───┘
//! ```

mod allocator;
mod prefix;

pub use allocator::IdentityAllocator;
pub use prefix::{derive_address, Ipv6Prefix, SUFFIX_RANGE};

use std::fmt;

/// Kernel connection mark assigned to one user.
///
/// Marks start at 1 and are never reused while the process lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mark(u32);

impl Mark {
    /// First mark handed out by a fresh allocator
    pub const FIRST: Self = Self(1);

    /// Wrap a raw mark value
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw value as passed to `SO_MARK`
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The mark after this one, if the mark space is not exhausted
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! nat66-socks: per-user IPv6 egress SOCKS5 proxy
//!
//! Every authenticated SOCKS5 username is bound to its own IPv6 source
//! address inside a configured /64. The address suffix is derived from the
//! username, so a user keeps the same address across restarts; the binding
//! is enforced in the kernel through a connection mark and an nftables SNAT
//! map.
//!
//! # Architecture
//!
//! ```text
//! Client --SOCKS5--> ProxyServer --> SessionHandler
//!                                       |  negotiate (username)
//!                                       |  IdentityAllocator --> NatController (mark -> address)
//!                                       |  MarkedDialer (SO_MARK) --> Destination
//!                                       v
//!                                    relay until the first side closes
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use nat66_socks::config::load_config;
//! use nat66_socks::connection::{ProxyServer, SessionHandler};
//! use nat66_socks::identity::IdentityAllocator;
//! use nat66_socks::outbound::MarkedDialer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/nat66-socks/config.json")?;
//!
//! let nat = nat66_socks::nat::connect(&config.nat).await?;
//! let allocator = Arc::new(IdentityAllocator::new(config.prefix()?, nat));
//! let dialer = Arc::new(MarkedDialer::from_config(&config.connection));
//! let handler = SessionHandler::socks5(allocator, dialer, &config.connection);
//!
//! let server = ProxyServer::bind(&config.listen, handler)?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`connection`]: Accept loop, sessions, relay and statistics
//! - [`error`]: Error types
//! - [`identity`]: Marks, address derivation and the identity allocator
//! - [`io`]: Stream abstraction and bidirectional copy
//! - [`lock`]: Single-instance PID lock
//! - [`nat`]: NAT controller backends
//! - [`outbound`]: Marked outbound dialing
//! - [`socks5`]: SOCKS5 server-side negotiation

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod io;
pub mod lock;
pub mod nat;
pub mod outbound;
pub mod socks5;

// Re-export commonly used types at the crate root
pub use config::{Config, ListenConfig, NatConfig};
pub use connection::{ProxyServer, ServerHandle, ServerState, SessionHandler};
pub use error::{
    AllocationError, ConfigError, ConnectionError, LockError, NatError, NegotiationError,
    OutboundError, ProxyError,
};
pub use identity::{derive_address, IdentityAllocator, Ipv6Prefix, Mark};
pub use lock::PidLock;
pub use nat::{MemoryNatController, NatController, NftController};
pub use outbound::{Dial, MarkedDialer, TargetAddr};
pub use socks5::{Negotiator, Socks5Negotiator};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

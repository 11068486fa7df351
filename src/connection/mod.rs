//! Connection handling module
//!
//! This module provides the session pipeline and its acceptor:
//! - Accept loop with a Listening / Draining / Stopped lifecycle
//! - Per-connection SOCKS5 session (negotiate, allocate, relay)
//! - Relay engine over marked upstream connections
//! - Statistics collection

mod manager;
mod relay;
mod session;
mod stats;

pub use manager::{ProxyServer, RunningServer, ServerHandle, ServerState};
pub use relay::RelayEngine;
pub use session::SessionHandler;
pub use stats::{ConnectionStats, SessionTicket, StatsSnapshot};

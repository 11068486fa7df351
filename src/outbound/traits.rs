//! Outbound trait definitions
//!
//! The relay engine reaches remote endpoints through the [`Dial`] trait, so
//! the marked dialer can be swapped for a plain one in tests.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::error::OutboundError;
use crate::identity::Mark;

/// Remote endpoint requested by a client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// Host name plus port, resolved at dial time
    Domain(String, u16),
    /// Literal socket address
    Ip(SocketAddr),
}

impl TargetAddr {
    /// Port component
    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::Domain(_, port) => *port,
            Self::Ip(addr) => addr.port(),
        }
    }

    /// Host component as text
    #[must_use]
    pub fn host(&self) -> String {
        match self {
            Self::Domain(host, _) => host.clone(),
            Self::Ip(addr) => addr.ip().to_string(),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(host, port) => write!(f, "{host}:{port}"),
            Self::Ip(addr) => write!(f, "{addr}"),
        }
    }
}

/// Stream network used for outbound dials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// IPv4 or IPv6, whichever resolves first
    Tcp,
    /// IPv4 only
    Tcp4,
    /// IPv6 only
    #[default]
    Tcp6,
}

impl Network {
    /// Whether `addr` may be dialed on this network
    #[must_use]
    pub const fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Self::Tcp => true,
            Self::Tcp4 => addr.is_ipv4(),
            Self::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Tcp4 => write!(f, "tcp4"),
            Self::Tcp6 => write!(f, "tcp6"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// Opens outbound connections carrying a connection mark
#[async_trait]
pub trait Dial: Send + Sync {
    /// Connect to `target` with `mark` applied to the socket.
    ///
    /// # Errors
    ///
    /// Returns `OutboundError` if the mark cannot be applied or the
    /// connection fails.
    async fn dial(&self, target: &TargetAddr, mark: Mark) -> Result<TcpStream, OutboundError>;
}

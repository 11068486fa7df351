//! Marked dialer
//!
//! Opens outbound TCP connections with `SO_MARK` set after socket creation
//! and before `connect()`, so the kernel's NAT rule sees the mark on the
//! very first packet. If the mark cannot be set the dial is aborted: an
//! unmarked socket would silently leave from the default source address.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::traits::{Dial, Network, TargetAddr};
use crate::config::ConnectionConfig;
use crate::error::OutboundError;
use crate::identity::Mark;

/// Default bound on one dial attempt, resolution included
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dialer that tags every outbound socket with a connection mark
#[derive(Debug, Clone)]
pub struct MarkedDialer {
    network: Network,
    connect_timeout: Duration,
}

impl MarkedDialer {
    /// Create a dialer for `network` bounded by `connect_timeout`
    #[must_use]
    pub const fn new(network: Network, connect_timeout: Duration) -> Self {
        Self {
            network,
            connect_timeout,
        }
    }

    /// Create a dialer from the connection section of the config
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.dial_network, config.connect_timeout())
    }

    /// Configured dial network
    #[must_use]
    pub const fn network(&self) -> Network {
        self.network
    }

    /// Connect to `target` over `network` with `mark` applied.
    ///
    /// Addresses are tried in resolver order until one connects; the whole
    /// attempt is bounded by the connect timeout.
    ///
    /// # Errors
    ///
    /// - `OutboundError::SocketOption` if `SO_MARK` could not be set
    /// - `OutboundError::Resolve` / `NoAddress` for resolution problems
    /// - `OutboundError::Refused` / `Unreachable` / `ConnectionFailed` /
    ///   `Timeout` for connect failures
    pub async fn dial_with(
        &self,
        network: Network,
        target: &TargetAddr,
        mark: Mark,
    ) -> Result<TcpStream, OutboundError> {
        match timeout(self.connect_timeout, self.dial_inner(network, target, mark)).await {
            Ok(result) => result,
            Err(_) => Err(OutboundError::Timeout {
                target: target.to_string(),
                timeout_secs: self.connect_timeout.as_secs(),
            }),
        }
    }

    async fn dial_inner(
        &self,
        network: Network,
        target: &TargetAddr,
        mark: Mark,
    ) -> Result<TcpStream, OutboundError> {
        let candidates = resolve(network, target).await?;

        let mut last_err = None;
        for addr in candidates {
            match connect_marked(addr, mark).await {
                Ok(stream) => {
                    debug!(dest = %target, %addr, %mark, "Marked connection established");
                    return Ok(stream);
                }
                // A mark failure will not get better on the next address
                Err(e @ OutboundError::SocketOption { .. }) => return Err(e),
                Err(e) => {
                    debug!(dest = %target, %addr, error = %e, "Dial attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| OutboundError::NoAddress {
            host: target.host(),
            network: network.to_string(),
        }))
    }
}

#[async_trait]
impl Dial for MarkedDialer {
    async fn dial(&self, target: &TargetAddr, mark: Mark) -> Result<TcpStream, OutboundError> {
        self.dial_with(self.network, target, mark).await
    }
}

/// Resolve `target` and keep the addresses usable on `network`
async fn resolve(network: Network, target: &TargetAddr) -> Result<Vec<SocketAddr>, OutboundError> {
    let all: Vec<SocketAddr> = match target {
        TargetAddr::Ip(addr) => vec![*addr],
        TargetAddr::Domain(host, port) => lookup_host((host.as_str(), *port))
            .await
            .map_err(|e| OutboundError::Resolve {
                host: host.clone(),
                reason: e.to_string(),
            })?
            .collect(),
    };

    let usable: Vec<SocketAddr> = all.into_iter().filter(|a| network.accepts(a)).collect();
    if usable.is_empty() {
        return Err(OutboundError::NoAddress {
            host: target.host(),
            network: network.to_string(),
        });
    }
    Ok(usable)
}

/// Create a marked socket and connect it to `addr`
async fn connect_marked(addr: SocketAddr, mark: Mark) -> Result<TcpStream, OutboundError> {
    let socket = create_socket(&addr, mark)?;

    // EINPROGRESS is expected for non-blocking sockets
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(OutboundError::from_connect(addr, &e)),
    }

    // TcpStream owns the fd from here on and closes it on drop
    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)
        .map_err(|e| OutboundError::connection_failed(addr, e.to_string()))?;

    stream
        .writable()
        .await
        .map_err(|e| OutboundError::connection_failed(addr, e.to_string()))?;

    match stream.take_error() {
        Ok(None) => {}
        Ok(Some(e)) | Err(e) => return Err(OutboundError::from_connect(addr, &e)),
    }

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    Ok(stream)
}

/// Create a non-blocking stream socket for `addr` with `mark` applied
fn create_socket(addr: &SocketAddr, mark: Mark) -> Result<Socket, OutboundError> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| OutboundError::connection_failed(*addr, e.to_string()))?;

    set_connection_mark(&socket, mark)?;

    socket
        .set_nonblocking(true)
        .map_err(|e| OutboundError::socket_option("O_NONBLOCK", e.to_string()))?;

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(15));
    socket
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| OutboundError::socket_option("TCP_KEEPALIVE", e.to_string()))?;

    Ok(socket)
}

/// Set `SO_MARK` on `socket`. Requires `CAP_NET_ADMIN`.
///
/// # Errors
///
/// Returns `OutboundError::SocketOption` if the kernel rejects the option.
pub fn set_connection_mark(socket: &Socket, mark: Mark) -> Result<(), OutboundError> {
    let fd = socket.as_raw_fd();
    let value: u32 = mark.get();

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            std::ptr::addr_of!(value).cast::<libc::c_void>(),
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(OutboundError::socket_option(
            "SO_MARK",
            format!("Failed to set connection mark {mark}: {err}"),
        ));
    }

    Ok(())
}

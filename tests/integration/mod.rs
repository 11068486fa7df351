//! Integration tests for nat66-socks
//!
//! # Test Organization
//!
//! - `identity_allocation`: allocator behaviour under concurrent first use
//! - `relay_engine`: relay over real loopback sockets
//! - `server_e2e`: full SOCKS5 sessions through the listening server
//! - `lifecycle`: shutdown and draining
//!
//! # Test Requirements
//!
//! None of these tests set `SO_MARK`; outbound connections go through
//! [`LoopbackDial`], which records the mark and connects without it.

pub mod identity_allocation;
pub mod lifecycle;
pub mod relay_engine;
pub mod server_e2e;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use nat66_socks::config::{ConnectionConfig, ListenConfig};
use nat66_socks::connection::{ProxyServer, SessionHandler};
use nat66_socks::error::OutboundError;
use nat66_socks::identity::{IdentityAllocator, Ipv6Prefix, Mark};
use nat66_socks::nat::{MemoryNatController, NatController};
use nat66_socks::outbound::{Dial, TargetAddr};

/// Prefix used throughout the suite
pub const TEST_PREFIX: &str = "2001:db8:1:2::/64";

/// Dials a fixed address, ignoring the requested target
pub struct LoopbackDial {
    addr: SocketAddr,
    dialed: Mutex<Vec<(TargetAddr, Mark)>>,
}

impl LoopbackDial {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            dialed: Mutex::new(Vec::new()),
        }
    }

    /// Targets and marks seen so far, in dial order
    pub fn dialed(&self) -> Vec<(TargetAddr, Mark)> {
        self.dialed.lock().clone()
    }
}

#[async_trait]
impl Dial for LoopbackDial {
    async fn dial(&self, target: &TargetAddr, mark: Mark) -> Result<TcpStream, OutboundError> {
        self.dialed.lock().push((target.clone(), mark));
        TcpStream::connect(self.addr)
            .await
            .map_err(|e| OutboundError::from_connect(self.addr, &e))
    }
}

/// Echo server accepting any number of connections
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

pub fn allocator(nat: Arc<dyn NatController>) -> Arc<IdentityAllocator> {
    Arc::new(IdentityAllocator::new(Ipv6Prefix::parse(TEST_PREFIX).unwrap(), nat))
}

/// Bound server on an ephemeral loopback port
pub fn test_server(nat: Arc<MemoryNatController>, dialer: Arc<LoopbackDial>) -> ProxyServer {
    let handler = SessionHandler::socks5(
        allocator(nat),
        dialer,
        &ConnectionConfig {
            handshake_timeout_secs: 5,
            ..ConnectionConfig::default()
        },
    );
    let listen = ListenConfig {
        address: "127.0.0.1:0".parse().unwrap(),
        ..ListenConfig::default()
    };
    ProxyServer::bind(&listen, handler).unwrap()
}

/// Run the client side of a SOCKS5 handshake and CONNECT to a domain.
///
/// Returns the CONNECT reply code.
pub async fn socks5_connect(stream: &mut TcpStream, user: &str, host: &str, port: u16) -> u8 {
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x02]);

    let mut auth = vec![0x01, user.len() as u8];
    auth.extend_from_slice(user.as_bytes());
    auth.extend_from_slice(&[4, b'p', b'a', b's', b's']);
    stream.write_all(&auth).await.unwrap();
    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await.unwrap();
    assert_eq!(status, [0x01, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    read_reply(stream).await
}

/// Read a full CONNECT reply and return its code
pub async fn read_reply(stream: &mut TcpStream) -> u8 {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0x05);
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        other => panic!("unexpected bound address type {other}"),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await.unwrap();
    head[1]
}

/// Poll `cond` until it holds or a few seconds pass
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

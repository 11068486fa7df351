//! SOCKS5 negotiation
//!
//! The username is the client's identity; the password is read and
//! ignored. Only CONNECT requests to domain-name targets are accepted, and
//! every rejection writes the matching reply before returning the error.
//!
//! ```text
//! client                          server
//!   | VER NMETHODS METHODS  -->      |
//!   |                      <-- VER 0x02
//!   | 0x01 ULEN UNAME PLEN PASSWD -->|
//!   |                   <-- 0x01 STATUS
//!   | VER CMD RSV ATYP ADDR PORT --> |
//!   |        <-- VER REP RSV ATYP BND.ADDR BND.PORT
//! ```

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use super::protocol::{
    ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_METHOD_NO_ACCEPTABLE, AUTH_METHOD_PASSWORD,
    AUTH_PASSWORD_VERSION, AUTH_STATUS_FAILURE, AUTH_STATUS_SUCCESS, CMD_CONNECT,
    REPLY_ADDRESS_TYPE_NOT_SUPPORTED, REPLY_COMMAND_NOT_SUPPORTED, REPLY_GENERAL_FAILURE,
    SOCKS5_VERSION,
};
use crate::error::NegotiationError;
use crate::io::ProxyStream;
use crate::outbound::TargetAddr;

/// Parsed client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Raw command byte
    pub command: u8,
    /// Requested remote endpoint
    pub target: TargetAddr,
}

impl Request {
    /// Whether this is a CONNECT request
    #[must_use]
    pub const fn is_connect(&self) -> bool {
        self.command == CMD_CONNECT
    }
}

/// Client handshake protocol used by a session
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Run the authentication exchange and return the client's username.
    async fn authenticate(&self, stream: &mut dyn ProxyStream)
        -> Result<Vec<u8>, NegotiationError>;

    /// Read the post-authentication request.
    async fn read_request(&self, stream: &mut dyn ProxyStream)
        -> Result<Request, NegotiationError>;

    /// Write a reply carrying `reply` and the bound address.
    async fn send_reply(
        &self,
        stream: &mut dyn ProxyStream,
        reply: u8,
        bound: Option<SocketAddr>,
    ) -> Result<(), NegotiationError>;
}

/// RFC 1928 server side with RFC 1929 username/password auth
#[derive(Debug, Clone, Copy, Default)]
pub struct Socks5Negotiator;

impl Socks5Negotiator {
    /// Create a negotiator
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Negotiator for Socks5Negotiator {
    async fn authenticate(
        &self,
        stream: &mut dyn ProxyStream,
    ) -> Result<Vec<u8>, NegotiationError> {
        // VER(1) NMETHODS(1) METHODS(1-255)
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(NegotiationError::UnsupportedVersion(header[0]));
        }

        let mut methods = vec![0u8; usize::from(header[1])];
        stream.read_exact(&mut methods).await?;

        if !methods.contains(&AUTH_METHOD_PASSWORD) {
            write_all(stream, &[SOCKS5_VERSION, AUTH_METHOD_NO_ACCEPTABLE]).await?;
            return Err(NegotiationError::NoAcceptableMethod);
        }
        write_all(stream, &[SOCKS5_VERSION, AUTH_METHOD_PASSWORD]).await?;

        // VER(1) ULEN(1) UNAME(ULEN) PLEN(1) PASSWD(PLEN)
        let version = stream.read_u8().await?;
        if version != AUTH_PASSWORD_VERSION {
            return Err(NegotiationError::protocol(format!(
                "invalid auth sub-negotiation version: {version:#04x}"
            )));
        }
        let username = read_prefixed(stream).await?;
        let _password = read_prefixed(stream).await?;

        if username.is_empty() {
            write_all(stream, &[AUTH_PASSWORD_VERSION, AUTH_STATUS_FAILURE]).await?;
            return Err(NegotiationError::EmptyUsername);
        }
        write_all(stream, &[AUTH_PASSWORD_VERSION, AUTH_STATUS_SUCCESS]).await?;

        trace!(user = %String::from_utf8_lossy(&username), "SOCKS5 authenticated");
        Ok(username)
    }

    async fn read_request(
        &self,
        stream: &mut dyn ProxyStream,
    ) -> Result<Request, NegotiationError> {
        // VER(1) CMD(1) RSV(1) ATYP(1) DST.ADDR(variable) DST.PORT(2)
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let [version, command, _rsv, atyp] = header;
        if version != SOCKS5_VERSION {
            return Err(NegotiationError::UnsupportedVersion(version));
        }

        let host = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;
                RequestHost::Ip(Ipv4Addr::from(octets).into())
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;
                RequestHost::Ip(Ipv6Addr::from(octets).into())
            }
            ATYP_DOMAIN => RequestHost::Domain(read_prefixed(stream).await?),
            other => {
                self.send_reply(stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED, None)
                    .await?;
                return Err(NegotiationError::UnsupportedAddressType(other));
            }
        };
        let port = stream.read_u16().await?;

        if command != CMD_CONNECT {
            // Echo the request's address family in the rejection
            let bound = match host {
                RequestHost::Ip(ip) if ip.is_ipv6() => {
                    Some(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0))
                }
                _ => None,
            };
            self.send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED, bound)
                .await?;
            return Err(NegotiationError::UnsupportedCommand(command));
        }

        let name = match host {
            RequestHost::Domain(name) => name,
            RequestHost::Ip(_) => {
                self.send_reply(stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED, None)
                    .await?;
                return Err(NegotiationError::UnsupportedAddressType(atyp));
            }
        };

        let domain = match String::from_utf8(name) {
            Ok(domain) if !domain.is_empty() => domain,
            _ => {
                self.send_reply(stream, REPLY_GENERAL_FAILURE, None).await?;
                return Err(NegotiationError::protocol("invalid domain name"));
            }
        };

        let request = Request {
            command,
            target: TargetAddr::Domain(domain, port),
        };
        trace!(dest = %request.target, "SOCKS5 request parsed");
        Ok(request)
    }

    async fn send_reply(
        &self,
        stream: &mut dyn ProxyStream,
        reply: u8,
        bound: Option<SocketAddr>,
    ) -> Result<(), NegotiationError> {
        let bound = bound.unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));

        let mut buf = Vec::with_capacity(22);
        buf.push(SOCKS5_VERSION);
        buf.push(reply);
        buf.push(0x00);
        match bound {
            SocketAddr::V4(addr) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
            }
            SocketAddr::V6(addr) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
            }
        }
        buf.extend_from_slice(&bound.port().to_be_bytes());

        write_all(stream, &buf).await
    }
}

enum RequestHost {
    Ip(std::net::IpAddr),
    Domain(Vec<u8>),
}

/// Read a one-byte length followed by that many bytes
async fn read_prefixed(stream: &mut dyn ProxyStream) -> Result<Vec<u8>, NegotiationError> {
    let len = stream.read_u8().await?;
    let mut buf = vec![0u8; usize::from(len)];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_all(stream: &mut dyn ProxyStream, buf: &[u8]) -> Result<(), NegotiationError> {
    stream.write_all(buf).await?;
    stream.flush().await?;
    Ok(())
}

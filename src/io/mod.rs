//! I/O utilities for nat66-socks
//!
//! [`ProxyStream`] is the byte stream a session works with, so negotiation
//! and relay code can run over TCP sockets in production and in-memory
//! duplex pipes in tests. [`relay_streams`] is the session's two-way copy.

mod copy;

use tokio::io::{AsyncRead, AsyncWrite};

pub use copy::{relay_streams, CopyEnd, CopyResult, DEFAULT_BUFFER_SIZE};

/// Duplex byte stream usable by a session
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

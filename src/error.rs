//! Error types for nat66-socks
//!
//! Errors are grouped per subsystem. Each group carries a recovery hint so
//! callers can tell a per-session failure from one that should stop the
//! process.

use std::io;
use std::net::{Ipv6Addr, SocketAddr};

use thiserror::Error;

use crate::identity::Mark;

/// Top-level error type for nat66-socks
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration errors (file parsing, validation, bad prefix)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// NAT controller errors (nftables unreachable, command failed)
    #[error("NAT error: {0}")]
    Nat(#[from] NatError),

    /// Identity allocation errors
    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    /// Outbound dial errors
    #[error("Outbound error: {0}")]
    Outbound(#[from] OutboundError),

    /// Client negotiation errors
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Listener and session errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Single-instance lock errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Lock(_) => false,
            Self::Nat(e) => e.is_recoverable(),
            Self::Allocation(e) => e.is_recoverable(),
            Self::Outbound(e) => e.is_recoverable(),
            Self::Negotiation(e) => e.is_recoverable(),
            Self::Connection(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// The configured IPv6 prefix is malformed
    #[error("Invalid IPv6 prefix '{prefix}': {reason}")]
    InvalidPrefix { prefix: String, reason: String },

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create an invalid prefix error
    pub fn invalid_prefix(prefix: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPrefix {
            prefix: prefix.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by a NAT controller
#[derive(Debug, Error)]
pub enum NatError {
    /// The packet-filter tool could not be started
    #[error("Failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// The packet-filter tool ran but reported failure
    #[error("Command '{command}' failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The controller refused or could not apply a binding
    #[error("Binding {mark} -> {address} rejected: {reason}")]
    BindingRejected {
        mark: Mark,
        address: Ipv6Addr,
        reason: String,
    },

    /// Controller is not initialised or not reachable
    #[error("NAT controller unavailable: {0}")]
    Unavailable(String),
}

impl NatError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Spawn { .. } => false,
            Self::CommandFailed { .. } => true,
            Self::BindingRejected { .. } => true,
            Self::Unavailable(_) => false,
        }
    }

    /// Create a command failure error
    pub fn command_failed(
        command: impl Into<String>,
        status: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            status: status.into(),
            stderr: stderr.into(),
        }
    }
}

/// Identity allocation errors
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Usernames must be non-empty
    #[error("Empty username cannot be allocated a mark")]
    EmptyIdentity,

    /// Registering the binding with the NAT controller failed.
    ///
    /// Nothing was committed; retrying the same user will try the same mark.
    #[error("Failed to register binding {mark} -> {address}: {source}")]
    Registration {
        mark: Mark,
        address: Ipv6Addr,
        #[source]
        source: NatError,
    },

    /// The mark space is used up for this process lifetime
    #[error("Mark space exhausted")]
    Exhausted,
}

impl AllocationError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::EmptyIdentity => false,
            Self::Registration { source, .. } => source.is_recoverable(),
            Self::Exhausted => false,
        }
    }
}

/// Outbound dial errors
#[derive(Debug, Error)]
pub enum OutboundError {
    /// Name resolution failed
    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// Resolution succeeded but nothing matched the dial network
    #[error("No {network} address found for {host}")]
    NoAddress { host: String, network: String },

    /// Connection failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    /// Remote actively refused the connection
    #[error("Connection to {addr} refused")]
    Refused { addr: SocketAddr },

    /// No route to the remote network or host
    #[error("{addr} unreachable: {reason}")]
    Unreachable { addr: SocketAddr, reason: String },

    /// Connection timeout
    #[error("Connection to {target} timed out after {timeout_secs}s")]
    Timeout { target: String, timeout_secs: u64 },

    /// Failed to set socket option (SO_MARK and friends)
    #[error("Failed to set outbound socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// I/O error during connection
    #[error("Outbound I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl OutboundError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Resolve { .. } => true,
            Self::NoAddress { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::Refused { .. } => true,
            Self::Unreachable { .. } => false,
            Self::Timeout { .. } => true,
            Self::SocketOption { .. } => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Classify an OS-level connect error
    pub fn from_connect(addr: SocketAddr, err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::ConnectionRefused {
            return Self::Refused { addr };
        }
        match err.raw_os_error() {
            Some(libc::ENETUNREACH | libc::EHOSTUNREACH | libc::EADDRNOTAVAIL) => Self::Unreachable {
                addr,
                reason: err.to_string(),
            },
            _ => Self::connection_failed(addr, err.to_string()),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Client negotiation and request errors
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// Unexpected protocol version byte
    #[error("Unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Client did not offer an acceptable auth method
    #[error("No acceptable authentication method offered")]
    NoAcceptableMethod,

    /// Client authenticated with an empty username
    #[error("Empty username in authentication request")]
    EmptyUsername,

    /// Request used a command other than CONNECT
    #[error("Unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// Request target was not a domain name
    #[error("Address type not supported: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Malformed message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Handshake did not finish in time
    #[error("Handshake timed out after {0}s")]
    Timeout(u64),

    /// I/O error during the handshake
    #[error("Negotiation I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl NegotiationError {
    /// Negotiation failures abort the session; the client may reconnect.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Listener and session errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to bind the listening socket
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Accept failed; terminates the accept loop
    #[error("Accept error: {0}")]
    AcceptError(String),

    /// Accept loop ended abnormally (task panicked or was cancelled)
    #[error("Invalid server state: {0}")]
    InvalidState(String),

    /// I/O error
    #[error("Connection I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ConnectionError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } => false,
            Self::AcceptError(_) => false,
            Self::InvalidState(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }
}

/// Errors from a session's relay stage
#[derive(Debug, Error)]
pub enum RelayError {
    /// Request was not a connect-style command
    #[error("Unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// Dialing the remote endpoint failed; no bytes were copied
    #[error("Dial failed: {0}")]
    Dial(#[from] OutboundError),

    /// Writing the reply to the client failed
    #[error("Reply failed: {0}")]
    Reply(#[from] NegotiationError),
}

/// Why a single session ended early.
///
/// Session errors stay inside the session task; they are logged and never
/// stop the acceptor.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake or request parsing failed
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// The user could not be bound to a mark
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// Dialing or replying failed
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl SessionError {
    /// Pipeline stage that failed, for log fields
    #[must_use]
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::Negotiation(_) => "negotiation",
            Self::Allocation(_) => "allocation",
            Self::Relay(RelayError::Dial(_)) => "dial",
            Self::Relay(_) => "relay",
        }
    }
}

/// Single-instance lock errors
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process already holds the lock
    #[error("Another instance is already running (PID: {pid})")]
    AlreadyRunning { pid: String },

    /// Lock file could not be created or written
    #[error("Failed to use PID file {path}: {reason}")]
    File { path: String, reason: String },
}

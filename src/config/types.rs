//! Configuration types for nat66-socks
//!
//! Configuration is loaded from JSON and validated once at startup. Every
//! field except `nat.prefix` has a default.

use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::identity::Ipv6Prefix;
use crate::outbound::Network;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Client-facing listener
    #[serde(default)]
    pub listen: ListenConfig,

    /// Source address translation
    #[serde(default)]
    pub nat: NatConfig,

    /// Session timeouts and relay tuning
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Single-instance PID file
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for out-of-range values and
    /// `ConfigError::InvalidPrefix` for a malformed prefix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.validate()?;
        self.nat.validate()?;
        self.connection.validate()?;
        self.log.validate()?;

        if self.pid_file.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "pid_file cannot be empty".into(),
            ));
        }

        Ok(())
    }

    /// Parsed NAT prefix
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidPrefix` if `nat.prefix` is malformed.
    pub fn prefix(&self) -> Result<Ipv6Prefix, ConfigError> {
        Ipv6Prefix::parse(&self.nat.prefix)
    }

    /// Configuration written by `--generate-config`
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            nat: NatConfig {
                prefix: "2001:db8::/64".into(),
                ..NatConfig::default()
            },
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            nat: NatConfig::default(),
            connection: ConnectionConfig::default(),
            log: LogConfig::default(),
            pid_file: default_pid_file(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Listen address (e.g., "[::]:10808")
    #[serde(default = "default_listen_address")]
    pub address: SocketAddr,

    /// TCP accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl ListenConfig {
    /// Validate listen configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::ValidationError(
                "listen.backlog must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            backlog: default_backlog(),
        }
    }
}

/// NAT controller backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NatBackend {
    /// Kernel nftables via the `nft` tool
    #[default]
    Nftables,

    /// In-process bindings only; no translation happens. Never accepted
    /// from a configuration file, only built in code.
    Memory,
}

impl std::fmt::Display for NatBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nftables => write!(f, "nftables"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Source address translation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatConfig {
    /// IPv6 prefix the per-user addresses are derived under
    #[serde(default)]
    pub prefix: String,

    /// Controller backend
    #[serde(default)]
    pub backend: NatBackend,

    /// nftables family (`ip6` or `inet`)
    #[serde(default = "default_family")]
    pub family: String,

    /// nftables table name
    #[serde(default = "default_table")]
    pub table: String,

    /// Postrouting NAT chain name
    #[serde(default = "default_chain")]
    pub chain: String,

    /// Mark to address map name
    #[serde(default = "default_map")]
    pub map: String,

    /// Chain hook priority
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Path or name of the `nft` executable
    #[serde(default = "default_nft_binary")]
    pub nft_binary: String,

    /// Drop bindings left by a previous run at startup
    #[serde(default = "default_true")]
    pub flush_on_start: bool,
}

impl NatConfig {
    /// Validate NAT configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "nat.prefix is required".into(),
            ));
        }
        Ipv6Prefix::parse(&self.prefix)?;

        // Every user would leave through the host's own address
        if self.backend == NatBackend::Memory {
            return Err(ConfigError::ValidationError(
                "nat.backend 'memory' performs no translation and cannot be used to run the proxy"
                    .into(),
            ));
        }

        if !matches!(self.family.as_str(), "ip6" | "inet") {
            return Err(ConfigError::ValidationError(format!(
                "nat.family must be 'ip6' or 'inet', got '{}'",
                self.family
            )));
        }

        // Names end up on the nft command line
        for (field, value) in [
            ("nat.table", &self.table),
            ("nat.chain", &self.chain),
            ("nat.map", &self.map),
        ] {
            if !is_valid_object_name(value) {
                return Err(ConfigError::ValidationError(format!(
                    "{field} '{value}' is not a valid nftables name"
                )));
            }
        }

        if self.nft_binary.is_empty() {
            return Err(ConfigError::ValidationError(
                "nat.nft_binary cannot be empty".into(),
            ));
        }

        Ok(())
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            backend: NatBackend::default(),
            family: default_family(),
            table: default_table(),
            chain: default_chain(),
            map: default_map(),
            priority: default_priority(),
            nft_binary: default_nft_binary(),
            flush_on_start: true,
        }
    }
}

/// Session timeouts and relay tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Outbound connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Negotiation timeout in seconds (0 disables)
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Relay idle timeout in seconds (0 disables)
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// Buffer size per relay direction
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Network used for outbound dials
    #[serde(default)]
    pub dial_network: Network,
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connection.connect_timeout_secs must be greater than 0".into(),
            ));
        }

        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(ConfigError::ValidationError(format!(
                "connection.buffer_size must be between {MIN_BUFFER_SIZE} and {MAX_BUFFER_SIZE}"
            )));
        }

        Ok(())
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Negotiation timeout, `None` when disabled
    #[must_use]
    pub const fn handshake_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.handshake_timeout_secs)
    }

    /// Relay idle timeout, `None` when disabled
    #[must_use]
    pub const fn idle_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.idle_timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            idle_timeout_secs: 0,
            buffer_size: default_buffer_size(),
            dial_network: Network::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default)]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::ValidationError(format!(
                "log.format must be 'json' or 'text', got '{}'",
                self.format
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

/// Smallest accepted relay buffer
pub const MIN_BUFFER_SIZE: usize = 512;

/// Largest accepted relay buffer
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

const fn non_zero_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

fn is_valid_object_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// Default value functions for serde

const fn default_true() -> bool {
    true
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 10808)
}

const fn default_backlog() -> u32 {
    1024
}

fn default_family() -> String {
    "ip6".into()
}

fn default_table() -> String {
    "nat".into()
}

fn default_chain() -> String {
    "postrouting".into()
}

fn default_map() -> String {
    "usermap".into()
}

const fn default_priority() -> i32 {
    100
}

fn default_nft_binary() -> String {
    "nft".into()
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_handshake_timeout_secs() -> u64 {
    10
}

const fn default_buffer_size() -> usize {
    2048
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/var/run/nat66-socks.pid")
}

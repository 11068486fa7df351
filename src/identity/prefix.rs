//! IPv6 prefix handling and per-user address derivation
//!
//! The derived address keeps the upper 64 bits of the configured prefix and
//! fills the interface identifier with bytes 24..32 of `SHA-256(username)`.
//! Collision probability therefore depends on the 64-bit suffix, not on the
//! full digest.

use std::fmt;
use std::net::Ipv6Addr;
use std::ops::Range;
use std::str::FromStr;

use ipnet::Ipv6Net;
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// Digest bytes used as the interface identifier
pub const SUFFIX_RANGE: Range<usize> = 24..32;

/// Longest prefix that still leaves room for the 64-bit suffix
const MAX_PREFIX_LEN: u8 = 64;

/// Validated IPv6 network prefix.
///
/// Only the upper 64 bits are kept; the low half of whatever was configured
/// is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Prefix {
    network: [u8; 8],
}

impl Ipv6Prefix {
    /// Build a prefix from an address, discarding its low 64 bits
    #[must_use]
    pub fn from_addr(addr: Ipv6Addr) -> Self {
        let mut network = [0u8; 8];
        network.copy_from_slice(&addr.octets()[..8]);
        Self { network }
    }

    /// Parse `2001:db8::` or `2001:db8::/64` style input.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidPrefix` for non-IPv6 input or a prefix
    /// length above 64.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ConfigError::invalid_prefix(input, "prefix is empty"));
        }

        if input.contains('/') {
            let net = Ipv6Net::from_str(input)
                .map_err(|e| ConfigError::invalid_prefix(input, e.to_string()))?;
            if net.prefix_len() > MAX_PREFIX_LEN {
                return Err(ConfigError::invalid_prefix(
                    input,
                    format!("prefix length /{} leaves no room for a 64-bit suffix", net.prefix_len()),
                ));
            }
            return Ok(Self::from_addr(net.network()));
        }

        let addr = Ipv6Addr::from_str(input)
            .map_err(|e| ConfigError::invalid_prefix(input, e.to_string()))?;
        Ok(Self::from_addr(addr))
    }

    /// Network half as an address with a zero interface identifier
    #[must_use]
    pub fn network(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[..8].copy_from_slice(&self.network);
        Ipv6Addr::from(octets)
    }

    /// Derive the dedicated address for `username`
    #[must_use]
    pub fn derive(&self, username: &[u8]) -> Ipv6Addr {
        let digest = Sha256::digest(username);
        let mut octets = [0u8; 16];
        octets[..8].copy_from_slice(&self.network);
        octets[8..].copy_from_slice(&digest[SUFFIX_RANGE]);
        Ipv6Addr::from(octets)
    }
}

impl FromStr for Ipv6Prefix {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/64", self.network())
    }
}

/// Derive the dedicated address for `username` under `prefix`.
///
/// Pure: the same inputs give the same address in every process.
#[must_use]
pub fn derive_address(prefix: Ipv6Addr, username: &[u8]) -> Ipv6Addr {
    Ipv6Prefix::from_addr(prefix).derive(username)
}

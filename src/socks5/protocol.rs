//! SOCKS5 protocol constants (RFC 1928, RFC 1929)

use crate::error::OutboundError;

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

// Authentication methods

/// No authentication required
pub const AUTH_METHOD_NONE: u8 = 0x00;

/// Username/password authentication (RFC 1929)
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;

/// No acceptable methods
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Username/password sub-negotiation version
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

/// Username/password accepted
pub const AUTH_STATUS_SUCCESS: u8 = 0x00;

/// Username/password rejected
pub const AUTH_STATUS_FAILURE: u8 = 0x01;

// Commands

/// CONNECT
pub const CMD_CONNECT: u8 = 0x01;

/// BIND
pub const CMD_BIND: u8 = 0x02;

/// UDP ASSOCIATE
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

// Address types

/// IPv4 address (4 bytes)
pub const ATYP_IPV4: u8 = 0x01;

/// Domain name (1 byte length + name)
pub const ATYP_DOMAIN: u8 = 0x03;

/// IPv6 address (16 bytes)
pub const ATYP_IPV6: u8 = 0x04;

// Reply codes

/// Succeeded
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// General SOCKS server failure
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;

/// Connection not allowed by ruleset
pub const REPLY_NOT_ALLOWED: u8 = 0x02;

/// Network unreachable
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;

/// Host unreachable
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;

/// Connection refused
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;

/// TTL expired
pub const REPLY_TTL_EXPIRED: u8 = 0x06;

/// Command not supported
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Address type not supported
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Convert reply code to human-readable message
#[must_use]
pub const fn reply_message(code: u8) -> &'static str {
    match code {
        REPLY_SUCCEEDED => "succeeded",
        REPLY_GENERAL_FAILURE => "general SOCKS server failure",
        REPLY_NOT_ALLOWED => "connection not allowed by ruleset",
        REPLY_NETWORK_UNREACHABLE => "network unreachable",
        REPLY_HOST_UNREACHABLE => "host unreachable",
        REPLY_CONNECTION_REFUSED => "connection refused",
        REPLY_TTL_EXPIRED => "TTL expired",
        REPLY_COMMAND_NOT_SUPPORTED => "command not supported",
        REPLY_ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
        _ => "unknown error",
    }
}

/// Reply code reported to the client for a failed dial
#[must_use]
pub const fn reply_for_dial_error(err: &OutboundError) -> u8 {
    match err {
        OutboundError::Refused { .. } => REPLY_CONNECTION_REFUSED,
        OutboundError::Unreachable { .. } | OutboundError::NoAddress { .. } => {
            REPLY_HOST_UNREACHABLE
        }
        _ => REPLY_GENERAL_FAILURE,
    }
}

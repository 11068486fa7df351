//! SOCKS5 client negotiation
//!
//! Sessions talk to clients through the [`Negotiator`] trait;
//! [`Socks5Negotiator`] is the SOCKS5 implementation.

mod negotiator;
pub mod protocol;

pub use negotiator::{Negotiator, Request, Socks5Negotiator};
pub use protocol::{reply_for_dial_error, reply_message};

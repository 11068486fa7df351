//! Outbound module
//!
//! Outbound connections leave through a [`Dial`] implementation. The
//! production dialer, [`MarkedDialer`], applies the per-user connection mark
//! to the socket before connecting so the kernel can pick the user's source
//! address.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use nat66_socks::identity::Mark;
//! use nat66_socks::outbound::{Dial, MarkedDialer, Network, TargetAddr};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dialer = MarkedDialer::new(Network::Tcp6, Duration::from_secs(10));
//! let target = TargetAddr::Domain("example.com".into(), 443);
//! let stream = dialer.dial(&target, Mark::new(1)).await?;
//! println!("Connected from {}", stream.local_addr()?);
//! # Ok(())
//! # }
//! ```

mod dialer;
mod traits;

pub use dialer::{set_connection_mark, MarkedDialer, DEFAULT_CONNECT_TIMEOUT};
pub use traits::{Dial, Network, TargetAddr};

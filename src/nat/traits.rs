//! NAT controller trait definitions

use std::net::Ipv6Addr;

use async_trait::async_trait;

use crate::error::NatError;
use crate::identity::Mark;

/// Kernel address-translation backend.
///
/// After `register_binding(mark, addr)` returns `Ok`, outbound traffic whose
/// socket carries `mark` must be source-translated to `addr`. Registering the
/// same mark again is a no-op or an overwrite, never an error.
#[async_trait]
pub trait NatController: Send + Sync {
    /// Install the `mark -> address` binding.
    ///
    /// # Errors
    ///
    /// Returns `NatError` if the binding could not be applied. In that case
    /// the kernel state for `mark` is unspecified but the caller must not
    /// hand the mark out.
    async fn register_binding(&self, mark: Mark, address: Ipv6Addr) -> Result<(), NatError>;

    /// Short backend name for logs
    fn name(&self) -> &str;
}

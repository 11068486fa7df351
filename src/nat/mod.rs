//! NAT controller backends
//!
//! A NAT controller turns `(mark, address)` bindings into kernel
//! source-NAT state. Two backends exist:
//!
//! - [`NftController`]: nftables map + SNAT rule (production)
//! - [`MemoryNatController`]: records bindings in memory (tests; configuration validation rejects it)

mod memory;
mod nft;
mod traits;

use std::sync::Arc;

use tracing::warn;

pub use memory::MemoryNatController;
pub use nft::NftController;
pub use traits::NatController;

use crate::config::{NatBackend, NatConfig};
use crate::error::NatError;

/// Build and initialise the controller selected by `config.backend`.
///
/// # Errors
///
/// Returns `NatError` if the backend cannot be reached or set up.
pub async fn connect(config: &NatConfig) -> Result<Arc<dyn NatController>, NatError> {
    match config.backend {
        NatBackend::Nftables => Ok(Arc::new(NftController::connect(config.clone()).await?)),
        NatBackend::Memory => {
            warn!("Using in-memory NAT backend: users will share the default source address");
            Ok(Arc::new(MemoryNatController::new()))
        }
    }
}

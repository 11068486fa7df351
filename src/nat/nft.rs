//! nftables NAT controller
//!
//! Drives the `nft` command-line tool. Startup installs (idempotently) the
//! following objects in one atomic transaction:
//!
//! ```text
//! table ip6 nat {
//!     map usermap { type mark : ipv6_addr ; }
//!     chain postrouting {
//!         type nat hook postrouting priority 100 ;
//!         snat to meta mark map @usermap
//!     }
//! }
//! ```
//!
//! Each user binding is then one `add element` into the map. A mark that
//! still maps to another address is swapped in a delete/add transaction.

use std::net::Ipv6Addr;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::traits::NatController;
use crate::config::NatConfig;
use crate::error::NatError;
use crate::identity::Mark;

/// NAT controller backed by nftables
#[derive(Debug)]
pub struct NftController {
    config: NatConfig,
    /// Serialises nft invocations issued by this process
    op_lock: Mutex<()>,
}

impl NftController {
    /// Create a controller without touching the kernel
    #[must_use]
    pub fn new(config: NatConfig) -> Self {
        Self {
            config,
            op_lock: Mutex::new(()),
        }
    }

    /// Create a controller, check that `nft` is usable and install the
    /// table, chain, map and SNAT rule.
    ///
    /// # Errors
    ///
    /// - `NatError::Unavailable` if `nft --version` cannot be run or fails
    /// - any other `NatError` if the setup transaction is rejected
    pub async fn connect(config: NatConfig) -> Result<Self, NatError> {
        let controller = Self::new(config);
        let version = controller
            .run(&["--version"], None)
            .await
            .map_err(|e| NatError::Unavailable(e.to_string()))?;
        debug!(version = %version.trim(), "nft available");
        controller.install().await?;
        Ok(controller)
    }

    /// Install the NAT objects.
    ///
    /// With `flush_on_start`, bindings left over from a previous run are
    /// removed so that reassigned marks cannot route a new user through an
    /// old user's address.
    ///
    /// # Errors
    ///
    /// Returns `NatError` if the transaction fails.
    pub async fn install(&self) -> Result<(), NatError> {
        let _guard = self.op_lock.lock().await;

        let cfg = &self.config;
        let rule_present = match self
            .run(&["list", "chain", &cfg.family, &cfg.table, &cfg.chain], None)
            .await
        {
            Ok(listing) => rule_references_map(&listing, &cfg.map),
            // Chain does not exist yet
            Err(NatError::CommandFailed { .. }) => false,
            Err(e) => return Err(e),
        };

        let script = self.setup_script(!rule_present);
        self.run(&["-f", "-"], Some(&script)).await?;

        info!(
            family = %cfg.family,
            table = %cfg.table,
            chain = %cfg.chain,
            map = %cfg.map,
            flushed = cfg.flush_on_start,
            rule_added = !rule_present,
            "nftables NAT objects ready"
        );
        Ok(())
    }

    /// Render the setup transaction
    #[must_use]
    pub fn setup_script(&self, with_rule: bool) -> String {
        let NatConfig {
            family,
            table,
            chain,
            map,
            priority,
            flush_on_start,
            ..
        } = &self.config;

        let mut script = format!(
            "add table {family} {table}\n\
             add chain {family} {table} {chain} {{ type nat hook postrouting priority {priority} ; }}\n\
             add map {family} {table} {map} {{ type mark : ipv6_addr ; }}\n"
        );
        if *flush_on_start {
            script.push_str(&format!("flush map {family} {table} {map}\n"));
        }
        if with_rule {
            // inet tables need the address family spelled out on snat
            let snat = if family == "inet" { "snat ip6 to" } else { "snat to" };
            script.push_str(&format!(
                "add rule {family} {table} {chain} {snat} meta mark map @{map}\n"
            ));
        }
        script
    }

    /// Map element literal for one binding
    #[must_use]
    pub fn element(mark: Mark, address: Ipv6Addr) -> String {
        format!("{{ {mark} : {address} }}")
    }

    /// Transaction that swaps whatever `mark` maps to for `address`.
    ///
    /// Applied atomically, so the mark is never left unmapped.
    #[must_use]
    pub fn replace_script(&self, mark: Mark, address: Ipv6Addr) -> String {
        let NatConfig {
            family, table, map, ..
        } = &self.config;
        format!(
            "delete element {family} {table} {map} {{ {mark} }}\n\
             add element {family} {table} {map} {}\n",
            Self::element(mark, address)
        )
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String, NatError> {
        let program = self.config.nft_binary.as_str();
        let command_line = format!("{program} {}", args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NatError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(|e| NatError::Spawn {
                program: program.to_string(),
                reason: format!("write stdin: {e}"),
            })?;
            // Close stdin so nft sees EOF
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(|e| NatError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(NatError::command_failed(
                command_line,
                output.status.to_string(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        debug!(command = %command_line, "nft command succeeded");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl NatController for NftController {
    async fn register_binding(&self, mark: Mark, address: Ipv6Addr) -> Result<(), NatError> {
        let _guard = self.op_lock.lock().await;

        let cfg = &self.config;
        let element = Self::element(mark, address);
        let added = self
            .run(
                &["add", "element", &cfg.family, &cfg.table, &cfg.map, &element],
                None,
            )
            .await;

        match added {
            Ok(_) => {
                debug!(%mark, %address, map = %cfg.map, "nft binding added");
                Ok(())
            }
            // The mark still maps to another address (kept across a restart
            // without flush); the kernel refuses to change it with `add`
            Err(NatError::CommandFailed { stderr, .. }) => {
                debug!(%mark, %address, reason = %stderr, "Replacing existing nft binding");
                let script = self.replace_script(mark, address);
                self.run(&["-f", "-"], Some(&script)).await?;
                info!(%mark, %address, map = %cfg.map, "nft binding replaced");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        "nftables"
    }
}

/// Whether a `nft list chain` listing already holds our SNAT rule
fn rule_references_map(listing: &str, map: &str) -> bool {
    let needle = format!("@{map}");
    listing
        .lines()
        .any(|line| line.contains("snat") && line.contains(&needle))
}

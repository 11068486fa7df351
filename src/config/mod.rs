//! Configuration module for nat66-socks
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use nat66_socks::config::load_config;
//!
//! let config = load_config("/etc/nat66-socks/config.json").unwrap();
//! println!("Listening on {}", config.listen.address);
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str,
    load_config_with_env, read_config, ENV_LISTEN_ADDR, ENV_LOG_LEVEL, ENV_PID_FILE, ENV_PREFIX,
};
pub use types::{
    Config, ConnectionConfig, ListenConfig, LogConfig, NatBackend, NatConfig, MAX_BUFFER_SIZE,
    MIN_BUFFER_SIZE,
};

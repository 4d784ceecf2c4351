//! Macvlan network driver for Docker
//!
//! This implementation provides a pure Rust remote network driver that:
//! - Keeps networks and endpoints in an in-memory registry
//! - Creates macvlan links on a host interface when containers join
//! - Derives endpoint MAC addresses from their IPv4 addresses
//! - Recovers networks the engine created before the driver started
//! - Serves the plugin protocol on a unix socket

pub mod commands;
pub mod config;
pub mod discovery;
pub mod error;
pub mod link;
pub mod plugin;
pub mod server;
pub mod state;
pub mod types;

// Re-export commonly used items
pub use config::{DriverConfig, MacvlanMode};
pub use error::{DriverError, Result};
pub use plugin::MacvlanDriver;
pub use state::Registry;

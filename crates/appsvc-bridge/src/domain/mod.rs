//! Domain layer for appsvc-bridge.
//!
//! Holds the runtime configuration.  Nothing here opens sockets or spawns
//! tasks; the binary and the infrastructure layer decide how the values are
//! used.

pub mod config;

pub use config::{BridgeConfig, ConfigError, ConfigFile, ServiceTarget};

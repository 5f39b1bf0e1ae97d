//! Application layer for appsvc-bridge.
//!
//! # Responsibilities
//!
//! - Owning the connection lifecycle (initialize, connect, close)
//! - Dispatching platform requests to the native call callback
//! - Queuing native returns and delivering them over the open connection
//!
//! # What does NOT belong here?
//!
//! - Socket I/O or frame parsing (that is infrastructure)
//! - Config file parsing (that is the domain layer)

pub mod bridge_service;
pub mod callbacks;

pub use bridge_service::{Bridge, BridgeError, CallbackKind, ConnectError};
pub use callbacks::{CallCallback, CallbackRegistry, ReturnCallback};

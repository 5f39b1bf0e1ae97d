//! Domain types with no I/O: the connection lifecycle.

pub mod state;

pub use state::{ConnectionState, StateError};

//! appsvc-bridge library crate.
//!
//! This crate bridges an application-service channel (the platform side) and
//! a native call target (the native side).  Inbound platform requests are
//! dispatched to a registered native call callback; native completions are
//! delivered back over the open channel.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Platform app-service channel (value sets, UTF-16 strings)
//!         ↕
//! [appsvc-bridge]
//!   ├── domain/           BridgeConfig and its TOML file schema
//!   ├── application/      Bridge: lifecycle, dispatch, return pump, callbacks
//!   └── infrastructure/
//!         ├── app_service/ Transport traits and request deferral
//!         ├── loopback/    In-memory platform service
//!         └── tcp/         JSON-lines app-service transport over TCP
//!         ↕
//! Native call target (NUL-terminated UTF-8 buffers)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O beyond reading its own config file.
//! - `application` talks to the platform only through the traits in
//!   `infrastructure::app_service`.
//! - Concrete transports live in `infrastructure` and depend on `tokio`.

/// Domain layer: configuration.
pub mod domain;

/// Application layer: the bridge itself.
pub mod application;

/// Infrastructure layer: transport seams and implementations.
pub mod infrastructure;

pub use application::{Bridge, BridgeError, ConnectError};
pub use domain::BridgeConfig;

//! Infrastructure layer for appsvc-bridge.
//!
//! # Responsibilities
//!
//! - Defining the transport seams the bridge talks through
//! - An in-memory platform service for tests and embedders
//! - A JSON-lines app-service transport over TCP
//!
//! # What does NOT belong here?
//!
//! - Call dispatch or return delivery (that is the application layer)
//! - Configuration parsing (that is the domain layer)

pub mod app_service;
pub mod loopback;
pub mod tcp;

pub use app_service::{
    AppServiceConnection, AppServiceRequest, AppServiceTransport, ConnectionEvent, ConnectionId,
    DeferralWaiter, OpenedConnection, RequestDeferral, TransportError,
};
pub use loopback::{loopback, LoopbackReply, LoopbackService, LoopbackTransport};
pub use tcp::TcpTransport;

//! Transport seams between the bridge and the platform app-service channel.
//!
//! The bridge never talks to a concrete channel.  It opens connections via
//! [`AppServiceTransport`], sends messages via [`AppServiceConnection`], and
//! receives inbound traffic as [`ConnectionEvent`]s on a channel returned by
//! `open`.
//!
//! # Event flow
//!
//! ```text
//! transport ──open()──────────────► OpenedConnection { connection, events }
//! platform  ──request──► events ──► Bridge::on_request_received
//! platform  ──close────► events ──► Bridge::on_closed
//! Bridge    ──send_message()─────► platform
//! ```
//!
//! # Request deferral
//!
//! Some platforms finish an inbound exchange as soon as the event handler
//! returns.  A handler that answers asynchronously takes a
//! [`RequestDeferral`] first and completes it after responding; the
//! transport waits on the matching [`DeferralWaiter`] before it tears the
//! exchange down.

use std::fmt;
use std::sync::Arc;

use appsvc_core::protocol::{ClosedStatus, FrameError, OpenStatus, ResponseStatus};
use appsvc_core::ValueSet;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use uuid::Uuid;

use crate::domain::config::ServiceTarget;

/// Identifies one connection instance.  A reconnect yields a new id.
pub type ConnectionId = Uuid;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The service host refused to open the channel.
    #[error("app service refused the connection: {0:?}")]
    Refused(OpenStatus),

    /// The channel is closed.
    #[error("app-service connection is closed")]
    Closed,

    /// The peer answered with a non-success status.
    #[error("app-service response failed with status {0:?}")]
    ResponseFailed(ResponseStatus),

    /// The peer dropped a request without answering it.
    #[error("request was dropped without a response")]
    NoResponse,

    /// A socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The peer sent something that is not valid at this point.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Inbound traffic on an open connection.
pub enum ConnectionEvent {
    /// The platform sent a request that expects a response.
    RequestReceived(Box<dyn AppServiceRequest>),
    /// The channel closed.  No further events follow.
    Closed(ClosedStatus),
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestReceived(req) => f
                .debug_tuple("RequestReceived")
                .field(req.message())
                .finish(),
            Self::Closed(status) => f.debug_tuple("Closed").field(status).finish(),
        }
    }
}

/// Result of a successful open.
pub struct OpenedConnection {
    pub connection: Arc<dyn AppServiceConnection>,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

/// Opens app-service connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AppServiceTransport: Send + Sync {
    /// Opens the channel to `target` and resolves once the platform confirms
    /// it open, or fails.
    async fn open(&self, target: &ServiceTarget) -> Result<OpenedConnection, TransportError>;
}

/// An open app-service channel.
#[async_trait]
pub trait AppServiceConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Sends a message to the platform and waits for its response.
    async fn send_message(&self, message: ValueSet) -> Result<ValueSet, TransportError>;
}

/// One inbound request awaiting a response.
#[async_trait]
pub trait AppServiceRequest: Send {
    fn message(&self) -> &ValueSet;

    /// Signals that the response will be sent asynchronously.
    ///
    /// Calling this more than once returns detached deferrals.
    fn take_deferral(&mut self) -> RequestDeferral;

    /// Sends the response.  A request is answered at most once.
    async fn send_response(&mut self, message: ValueSet) -> Result<(), TransportError>;
}

// ── Deferral ──────────────────────────────────────────────────────────────────

/// Handler-side half of a deferral.  Complete it after responding.
///
/// Dropping an uncompleted deferral completes it, so a transport never waits
/// forever on a handler that bailed out early.
#[derive(Debug)]
pub struct RequestDeferral {
    done: Option<oneshot::Sender<()>>,
}

/// Transport-side half of a deferral.
#[derive(Debug)]
pub struct DeferralWaiter {
    done: oneshot::Receiver<()>,
}

impl RequestDeferral {
    /// Creates a linked deferral / waiter pair.
    pub fn new() -> (Self, DeferralWaiter) {
        let (tx, rx) = oneshot::channel();
        (Self { done: Some(tx) }, DeferralWaiter { done: rx })
    }

    /// A deferral nobody waits on, for transports whose exchanges already
    /// end only when the response is written.
    pub fn detached() -> Self {
        Self { done: None }
    }

    pub fn complete(mut self) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for RequestDeferral {
    fn drop(&mut self) {
        if let Some(tx) = self.done.take() {
            warn!("request deferral dropped without being completed");
            let _ = tx.send(());
        }
    }
}

impl DeferralWaiter {
    /// Resolves once the handler completes (or drops) its deferral.
    pub async fn wait(self) {
        let _ = self.done.await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

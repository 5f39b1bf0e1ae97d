//! Connection lifecycle state machine.
//!
//! ```text
//!                 connect             open ok
//! Unconnected ────────────► Connecting ────────► Connected
//!      ▲                        │                    │
//!      └────── open failed ─────┘                    │ closed
//!                                                    ▼
//!           Connecting ◄──────── connect ──────── Closed
//! ```
//!
//! A close notification moves any state to `Closed`.  Leaving `Closed`
//! requires a fresh connect, which produces a new connection instance.

use std::fmt;

use thiserror::Error;

/// Current state of the bridge's single app-service connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection has been attempted, or the last attempt failed.
    #[default]
    Unconnected,
    /// An open request is in flight.
    Connecting,
    /// The channel is open and traffic may flow.
    Connected,
    /// The platform closed the channel.
    Closed,
}

/// A transition that is not allowed from the current state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot {action} while {from}")]
pub struct StateError {
    pub from: ConnectionState,
    pub action: &'static str,
}

impl ConnectionState {
    /// `Unconnected | Closed → Connecting`.
    ///
    /// # Errors
    ///
    /// Fails while a connection attempt is in flight or already open.
    pub fn begin_connect(self) -> Result<Self, StateError> {
        match self {
            Self::Unconnected | Self::Closed => Ok(Self::Connecting),
            from => Err(StateError {
                from,
                action: "connect",
            }),
        }
    }

    /// `Connecting → Connected`.
    ///
    /// # Errors
    ///
    /// Fails from any state other than `Connecting`.
    pub fn open_succeeded(self) -> Result<Self, StateError> {
        match self {
            Self::Connecting => Ok(Self::Connected),
            from => Err(StateError {
                from,
                action: "complete a connect",
            }),
        }
    }

    /// `Connecting → Unconnected`.
    ///
    /// # Errors
    ///
    /// Fails from any state other than `Connecting`.
    pub fn open_failed(self) -> Result<Self, StateError> {
        match self {
            Self::Connecting => Ok(Self::Unconnected),
            from => Err(StateError {
                from,
                action: "fail a connect",
            }),
        }
    }

    /// Any state `→ Closed`.
    pub fn close(self) -> Self {
        Self::Closed
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

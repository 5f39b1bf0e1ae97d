//! # appsvc-core
//!
//! Shared library for the app-service bridge containing the call envelope,
//! return messages, platform string conversion, transport frames and the
//! connection state machine.
//!
//! This crate has zero dependencies on async runtimes, sockets, or the
//! platform's service APIs.  Everything here is plain data plus the rules
//! that govern it, so both the bridge and any transport host can share it.
//!
//! # Architecture overview
//!
//! The bridge sits between two worlds:
//!
//! - the **platform** side, an application-service channel whose strings are
//!   UTF-16 ([`PlatformString`]) and whose messages are key/value sets
//!   ([`ValueSet`]);
//! - the **native** side, a call target that speaks NUL-terminated UTF-8
//!   buffers (`CString` / `CStr`).
//!
//! This crate defines:
//!
//! - **`text`** – Conversion between platform strings and native buffers.
//! - **`protocol`** – The encoded call string, return messages, value-set
//!   keys, JSON-lines frames and a sequence counter for frame ids.
//! - **`domain`** – The connection lifecycle state machine.

pub mod domain;
pub mod protocol;
pub mod text;

pub use domain::state::{ConnectionState, StateError};
pub use protocol::envelope::{CallEnvelope, EnvelopeError, FIELD_DELIMITER};
pub use protocol::messages::{Outcome, OutcomeError, RequestId, ReturnMessage, ValueSet};
pub use text::{EncodingError, PlatformString};

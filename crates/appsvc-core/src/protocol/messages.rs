//! Message types exchanged over the application-service channel.
//!
//! The platform channel carries *value sets*: flat maps from string keys to
//! platform strings.  This module defines the value set itself, the keys the
//! bridge reads and writes, and the typed messages built on top of it.
//!
//! # Message shapes
//!
//! ```text
//! inbound request   {method, input, ui}
//! request response  {ack}            on success
//!                   {error}          when dispatch failed
//! return            {return_id, result, error}
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::envelope::{CallEnvelope, EnvelopeError};
use crate::text::{EncodingError, PlatformString};

/// Well-known value-set keys.
pub mod keys {
    /// Method name of an inbound request.
    pub const METHOD: &str = "method";
    /// Input payload of an inbound request.
    pub const INPUT: &str = "input";
    /// UI-context token of an inbound request.
    pub const UI: &str = "ui";
    /// Synchronous acknowledgment returned by the call callback.
    pub const ACK: &str = "ack";
    /// Error text: a failed dispatch, or the error half of a return.
    pub const ERROR: &str = "error";
    /// Request identifier carried by a return.
    pub const RETURN_ID: &str = "return_id";
    /// Result half of a return.
    pub const RESULT: &str = "result";
}

// ── ValueSet ──────────────────────────────────────────────────────────────────

/// A platform message: an ordered map of keys to platform strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueSet(BTreeMap<String, PlatformString>);

impl ValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any previous value under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PlatformString>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style [`ValueSet::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PlatformString>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&PlatformString> {
        self.0.get(key)
    }

    /// Returns the value under `key` decoded as UTF-8 text.
    ///
    /// Returns `Ok(None)` when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError`] if the stored platform string is malformed.
    pub fn get_text(&self, key: &str) -> Result<Option<String>, EncodingError> {
        self.0
            .get(key)
            .map(PlatformString::to_string_checked)
            .transpose()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Inbound request decoding ──────────────────────────────────────────────────

/// Errors produced when an inbound request value set cannot become a call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestDecodeError {
    /// A required key is absent.
    #[error("request is missing the '{0}' value")]
    MissingKey(&'static str),

    /// A value is not representable as UTF-8 text.
    #[error("request value '{key}' is malformed: {source}")]
    Encoding {
        key: &'static str,
        #[source]
        source: EncodingError,
    },

    /// The decoded fields cannot form a valid call.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Decodes `(method, input, ui)` from an inbound request value set.
///
/// `method` is required; `input` and `ui` default to empty strings when the
/// platform omits them.
///
/// # Errors
///
/// See [`RequestDecodeError`].
pub fn decode_request(message: &ValueSet) -> Result<CallEnvelope, RequestDecodeError> {
    let text = |key: &'static str| {
        message
            .get_text(key)
            .map_err(|source| RequestDecodeError::Encoding { key, source })
    };
    let method = text(keys::METHOD)?.ok_or(RequestDecodeError::MissingKey(keys::METHOD))?;
    let input = text(keys::INPUT)?.unwrap_or_default();
    let ui = text(keys::UI)?.unwrap_or_default();
    Ok(CallEnvelope::new(method, input, ui)?)
}

/// Builds the inbound request value set for a call.
pub fn encode_request(call: &CallEnvelope) -> ValueSet {
    ValueSet::new()
        .with(keys::METHOD, call.method.as_str())
        .with(keys::INPUT, call.input.as_str())
        .with(keys::UI, call.ui.as_str())
}

// ── Returns ───────────────────────────────────────────────────────────────────

/// Opaque identifier correlating a return with the call that produced it.
///
/// The bridge never interprets identifiers; it only carries them end to end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The outcome of a completed call: exactly one of result or error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok(String),
    Err(String),
}

/// Errors produced when a `(result, error)` pair is not a valid outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutcomeError {
    /// Both result and error carry content.
    #[error("return carries both a result and an error")]
    Ambiguous,
}

impl Outcome {
    /// Builds an outcome from the triple form, where an empty string means
    /// "absent".
    ///
    /// A non-empty `error` makes the outcome an error.  Two empty strings are
    /// a successful, empty result.
    ///
    /// # Errors
    ///
    /// Returns [`OutcomeError::Ambiguous`] if both strings are non-empty.
    pub fn from_parts(result: &str, error: &str) -> Result<Self, OutcomeError> {
        match (result.is_empty(), error.is_empty()) {
            (false, false) => Err(OutcomeError::Ambiguous),
            (_, false) => Ok(Self::Err(error.to_owned())),
            (_, true) => Ok(Self::Ok(result.to_owned())),
        }
    }

    /// Splits the outcome back into `(result, error)`; the unused half is empty.
    pub fn as_parts(&self) -> (&str, &str) {
        match self {
            Self::Ok(result) => (result, ""),
            Self::Err(error) => ("", error),
        }
    }
}

/// A correlated response for a previously dispatched call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnMessage {
    pub id: RequestId,
    pub outcome: Outcome,
}

impl ReturnMessage {
    /// Builds a return from the `(request_id, result, error)` triple.
    ///
    /// # Errors
    ///
    /// Returns [`OutcomeError::Ambiguous`] if both result and error are set.
    pub fn from_parts(id: &str, result: &str, error: &str) -> Result<Self, OutcomeError> {
        Ok(Self {
            id: RequestId::new(id),
            outcome: Outcome::from_parts(result, error)?,
        })
    }

    /// Encodes the return as the value set delivered to the platform.
    ///
    /// Both `result` and `error` are always present so the platform can read
    /// the triple without checking for absent keys.
    pub fn to_value_set(&self) -> ValueSet {
        let (result, error) = self.outcome.as_parts();
        ValueSet::new()
            .with(keys::RETURN_ID, self.id.as_str())
            .with(keys::RESULT, result)
            .with(keys::ERROR, error)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_result_only_is_ok() {
        assert_eq!(
            Outcome::from_parts("result-data", ""),
            Ok(Outcome::Ok("result-data".to_string()))
        );
    }

    #[test]
    fn test_outcome_from_error_only_is_err() {
        assert_eq!(
            Outcome::from_parts("", "boom"),
            Ok(Outcome::Err("boom".to_string()))
        );
    }

    #[test]
    fn test_outcome_from_two_empty_strings_is_empty_ok() {
        assert_eq!(Outcome::from_parts("", ""), Ok(Outcome::Ok(String::new())));
    }

    #[test]
    fn test_outcome_with_both_halves_is_ambiguous() {
        assert_eq!(
            Outcome::from_parts("r", "e"),
            Err(OutcomeError::Ambiguous)
        );
    }

    #[test]
    fn test_as_parts_leaves_unused_half_empty() {
        assert_eq!(Outcome::Ok("r".into()).as_parts(), ("r", ""));
        assert_eq!(Outcome::Err("e".into()).as_parts(), ("", "e"));
    }

    #[test]
    fn test_return_value_set_carries_the_triple() {
        // Arrange
        let ret = ReturnMessage::from_parts("req-42", "result-data", "").unwrap();

        // Act
        let set = ret.to_value_set();

        // Assert
        assert_eq!(set.get_text(keys::RETURN_ID).unwrap().as_deref(), Some("req-42"));
        assert_eq!(set.get_text(keys::RESULT).unwrap().as_deref(), Some("result-data"));
        assert_eq!(set.get_text(keys::ERROR).unwrap().as_deref(), Some(""));
    }

    #[test]
    fn test_decode_request_reads_all_fields() {
        let set = ValueSet::new()
            .with(keys::METHOD, "echo")
            .with(keys::INPUT, "hello")
            .with(keys::UI, "ui1");

        let call = decode_request(&set).unwrap();

        assert_eq!(call.encode(), "echo|hello|ui1");
    }

    #[test]
    fn test_decode_request_defaults_optional_fields() {
        let set = ValueSet::new().with(keys::METHOD, "ping");

        let call = decode_request(&set).unwrap();

        assert_eq!(call.input, "");
        assert_eq!(call.ui, "");
    }

    #[test]
    fn test_decode_request_without_method_fails() {
        let set = ValueSet::new().with(keys::INPUT, "hello");

        assert_eq!(
            decode_request(&set),
            Err(RequestDecodeError::MissingKey(keys::METHOD))
        );
    }

    #[test]
    fn test_decode_request_with_malformed_value_fails() {
        let set = ValueSet::new()
            .with(keys::METHOD, "echo")
            .with(keys::UI, PlatformString::from_units(vec![0xD800]));

        assert!(matches!(
            decode_request(&set),
            Err(RequestDecodeError::Encoding { key: "ui", .. })
        ));
    }

    #[test]
    fn test_encode_request_round_trips_through_decode() {
        let call = CallEnvelope::new("open", "a|b", "w2").unwrap();
        assert_eq!(decode_request(&encode_request(&call)).unwrap(), call);
    }

    #[test]
    fn test_value_set_serializes_as_flat_json_object() {
        let set = ValueSet::new().with(keys::ACK, "ok");

        let json = serde_json::to_string(&set).unwrap();

        assert_eq!(json, r#"{"ack":"ok"}"#);
    }
}

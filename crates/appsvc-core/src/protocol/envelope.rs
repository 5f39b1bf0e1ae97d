//! The encoded call string handed to the native call callback.
//!
//! A call is a `(method, input, ui)` triple flattened into one opaque string:
//!
//! ```text
//! method|input|ui
//! ```
//!
//! - `method` names the native handler and must not contain `|`.
//! - `input` is the payload and MAY contain `|`.
//! - `ui` is an opaque UI-context token and must not contain `|`.
//!
//! Decoding splits on the first and the last delimiter, so an `input` that
//! itself contains delimiters survives the round trip.  No field may contain
//! NUL because the encoded string crosses the native boundary as a
//! NUL-terminated buffer.

use std::fmt;

use thiserror::Error;

/// Separator between the three fields of an encoded call.
pub const FIELD_DELIMITER: char = '|';

/// Errors produced when building or parsing an encoded call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The method name is empty.
    #[error("call method must not be empty")]
    EmptyMethod,

    /// A field that must be delimiter-free contains the delimiter.
    #[error("call {field} must not contain '|'")]
    DelimiterInField { field: &'static str },

    /// A field contains a NUL character.
    #[error("call {field} must not contain NUL")]
    NulInField { field: &'static str },

    /// The encoded string does not have three fields.
    #[error("encoded call has {found} field(s), expected 3")]
    MissingFields { found: usize },
}

/// A decoded call: method name, input payload and UI token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallEnvelope {
    pub method: String,
    pub input: String,
    pub ui: String,
}

impl CallEnvelope {
    /// Builds a call after checking every field can be encoded losslessly.
    ///
    /// # Errors
    ///
    /// Returns an [`EnvelopeError`] if the method is empty, if `method` or
    /// `ui` contains the delimiter, or if any field contains NUL.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use appsvc_core::CallEnvelope;
    ///
    /// let call = CallEnvelope::new("echo", "hello", "ui1").unwrap();
    /// assert_eq!(call.encode(), "echo|hello|ui1");
    /// ```
    pub fn new(
        method: impl Into<String>,
        input: impl Into<String>,
        ui: impl Into<String>,
    ) -> Result<Self, EnvelopeError> {
        let call = Self {
            method: method.into(),
            input: input.into(),
            ui: ui.into(),
        };
        call.validate()?;
        Ok(call)
    }

    /// Flattens the call into its encoded form.
    pub fn encode(&self) -> String {
        let mut out =
            String::with_capacity(self.method.len() + self.input.len() + self.ui.len() + 2);
        out.push_str(&self.method);
        out.push(FIELD_DELIMITER);
        out.push_str(&self.input);
        out.push(FIELD_DELIMITER);
        out.push_str(&self.ui);
        out
    }

    /// Parses an encoded call.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::MissingFields`] when fewer than two delimiters
    /// are present, and the field errors of [`CallEnvelope::new`] otherwise.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use appsvc_core::CallEnvelope;
    ///
    /// let call = CallEnvelope::decode("render|a|b|c|window-7").unwrap();
    /// assert_eq!(call.method, "render");
    /// assert_eq!(call.input, "a|b|c");
    /// assert_eq!(call.ui, "window-7");
    /// ```
    pub fn decode(encoded: &str) -> Result<Self, EnvelopeError> {
        let (method, rest) = encoded
            .split_once(FIELD_DELIMITER)
            .ok_or(EnvelopeError::MissingFields { found: 1 })?;
        let (input, ui) = rest
            .rsplit_once(FIELD_DELIMITER)
            .ok_or(EnvelopeError::MissingFields { found: 2 })?;
        Self::new(method, input, ui)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if self.method.is_empty() {
            return Err(EnvelopeError::EmptyMethod);
        }
        if self.method.contains(FIELD_DELIMITER) {
            return Err(EnvelopeError::DelimiterInField { field: "method" });
        }
        if self.ui.contains(FIELD_DELIMITER) {
            return Err(EnvelopeError::DelimiterInField { field: "ui" });
        }
        for (field, value) in [
            ("method", &self.method),
            ("input", &self.input),
            ("ui", &self.ui),
        ] {
            if value.contains('\0') {
                return Err(EnvelopeError::NulInField { field });
            }
        }
        Ok(())
    }
}

impl fmt::Display for CallEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

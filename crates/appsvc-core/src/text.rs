//! Platform string ↔ native buffer conversion.
//!
//! The platform side of the bridge stores text as UTF-16 code units, the way
//! WinRT `HSTRING` does.  The native side expects NUL-terminated UTF-8
//! buffers.  Every crossing of the boundary goes through this module.
//!
//! # What are UTF-16 code units and surrogates? (for beginners)
//!
//! UTF-16 stores text as 16-bit *code units*.  Most characters fit in one
//! unit.  Characters above U+FFFF (emoji, many historic scripts) do not, so
//! they are split into two units called a *surrogate pair*: a high surrogate
//! (0xD800..=0xDBFF) followed by a low surrogate (0xDC00..=0xDFFF).
//!
//! | Text | UTF-16 units     | UTF-8 bytes           |
//! |------|------------------|-----------------------|
//! | `a`  | `0061`           | `61`                  |
//! | `é`  | `00E9`           | `C3 A9`               |
//! | `🌍` | `D83C DF0D`      | `F0 9F 8C 8D`         |
//!
//! Nothing stops a platform string from holding a surrogate on its own, with
//! no partner.  Such a string is legal UTF-16 *storage* but it is not text:
//! it has no UTF-8 form at all.  [`PlatformString`] therefore keeps the raw
//! units and only produces a Rust `String` through a checked conversion.
//!
//! # Ownership contract
//!
//! - [`PlatformString::to_buffer`] allocates a fresh `CString`.  The caller
//!   owns it and frees it by dropping it.
//! - [`PlatformString::from_buffer`] only borrows the `CStr`; the producer
//!   keeps ownership of the buffer.
//!
//! # Failure modes
//!
//! Buffers are NUL-terminated text, so a string with an interior NUL cannot
//! be represented.  Conversion never truncates: it returns an
//! [`EncodingError`] instead.

use std::ffi::{CStr, CString};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced when text cannot cross the platform/native boundary intact.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The text contains a NUL character at the given UTF-8 byte offset.
    #[error("interior NUL at byte {position}")]
    InteriorNul { position: usize },

    /// A native buffer was not valid UTF-8.
    #[error("buffer is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },

    /// A platform string contained an unpaired UTF-16 surrogate.
    #[error("platform string contains an unpaired surrogate at unit {position}")]
    UnpairedSurrogate { position: usize },
}

/// A platform-side string: a sequence of UTF-16 code units.
///
/// Platform strings can hold content that has no UTF-8 form (unpaired
/// surrogates), which is why conversion to a native buffer is fallible.
///
/// # Examples
///
/// ```rust
/// use appsvc_core::text::PlatformString;
///
/// let platform = PlatformString::from("echo|hi|ui1");
/// let buffer = platform.to_buffer().unwrap();
/// assert_eq!(buffer.to_str().unwrap(), "echo|hi|ui1");
///
/// // A lone high surrogate cannot become a native buffer.
/// let broken = PlatformString::from_units(vec![0xD800]);
/// assert!(broken.to_buffer().is_err());
/// ```
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct PlatformString {
    /// Raw UTF-16 code units, stored exactly as the platform produced them.
    units: Vec<u16>,
}

impl PlatformString {
    /// Creates an empty platform string.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps raw UTF-16 code units without validation.
    pub fn from_units(units: Vec<u16>) -> Self {
        Self { units }
    }

    /// Returns the raw UTF-16 code units.
    pub fn units(&self) -> &[u16] {
        &self.units
    }

    /// Number of UTF-16 code units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Decodes the code units into a Rust `String`.
    ///
    /// Walks the units with [`char::decode_utf16`], which pairs up surrogates
    /// and reports any surrogate left without a partner.  `position` in the
    /// error counts UTF-16 units, not bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::UnpairedSurrogate`] if the units are not
    /// well-formed UTF-16.
    pub fn to_string_checked(&self) -> Result<String, EncodingError> {
        let mut out = String::with_capacity(self.units.len());
        let mut position = 0;
        for decoded in char::decode_utf16(self.units.iter().copied()) {
            match decoded {
                Ok(c) => {
                    out.push(c);
                    position += c.len_utf16();
                }
                Err(_) => return Err(EncodingError::UnpairedSurrogate { position }),
            }
        }
        Ok(out)
    }

    /// Converts this platform string into a newly allocated native buffer.
    ///
    /// # Errors
    ///
    /// - [`EncodingError::UnpairedSurrogate`] if the string is not valid UTF-16.
    /// - [`EncodingError::InteriorNul`] if the string contains a NUL.
    pub fn to_buffer(&self) -> Result<CString, EncodingError> {
        let text = self.to_string_checked()?;
        to_buffer(&text)
    }

    /// Builds a platform string from a borrowed native buffer.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::InvalidUtf8`] if the buffer is not UTF-8.
    pub fn from_buffer(buffer: &CStr) -> Result<Self, EncodingError> {
        from_buffer(buffer).map(Self::from)
    }
}

impl From<&str> for PlatformString {
    fn from(s: &str) -> Self {
        Self {
            units: s.encode_utf16().collect(),
        }
    }
}

impl From<String> for PlatformString {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl fmt::Debug for PlatformString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf16_lossy(&self.units))
    }
}

impl fmt::Display for PlatformString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf16_lossy(&self.units))
    }
}

// On the wire a platform string is a JSON string.  Serialization refuses
// strings that have no UTF-8 form rather than writing replacement characters.
impl Serialize for PlatformString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = self
            .to_string_checked()
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for PlatformString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self::from(text))
    }
}

/// Copies UTF-8 text into a newly allocated NUL-terminated buffer.
///
/// # Errors
///
/// Returns [`EncodingError::InteriorNul`] if `text` contains a NUL.
pub fn to_buffer(text: &str) -> Result<CString, EncodingError> {
    CString::new(text).map_err(|e| EncodingError::InteriorNul {
        position: e.nul_position(),
    })
}

/// Reads a borrowed NUL-terminated buffer as UTF-8 text.
///
/// # Errors
///
/// Returns [`EncodingError::InvalidUtf8`] if the bytes are not UTF-8.
pub fn from_buffer(buffer: &CStr) -> Result<String, EncodingError> {
    buffer
        .to_str()
        .map(str::to_owned)
        .map_err(|e| EncodingError::InvalidUtf8 {
            valid_up_to: e.valid_up_to(),
        })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_text_crosses_boundary_unchanged() {
        // Arrange
        let platform = PlatformString::from("echo|hello|ui1");

        // Act
        let buffer = platform.to_buffer().unwrap();
        let back = PlatformString::from_buffer(&buffer).unwrap();

        // Assert
        assert_eq!(buffer.to_str().unwrap(), "echo|hello|ui1");
        assert_eq!(back, platform);
    }

    #[test]
    fn test_non_bmp_text_crosses_boundary_unchanged() {
        // Characters outside the BMP use a surrogate pair in UTF-16.
        let platform = PlatformString::from("héllo 🌍");
        assert_eq!(platform.len(), 8);

        let buffer = platform.to_buffer().unwrap();
        assert_eq!(buffer.to_str().unwrap(), "héllo 🌍");
    }

    #[test]
    fn test_interior_nul_is_rejected_not_truncated() {
        let platform = PlatformString::from("ab\0cd");

        let result = platform.to_buffer();

        assert_eq!(result, Err(EncodingError::InteriorNul { position: 2 }));
    }

    #[test]
    fn test_unpaired_surrogate_is_rejected() {
        // 0xD800 is a lone high surrogate.
        let platform = PlatformString::from_units(vec![0x0061, 0xD800, 0x0062]);

        let result = platform.to_buffer();

        assert_eq!(result, Err(EncodingError::UnpairedSurrogate { position: 1 }));
    }

    #[test]
    fn test_invalid_utf8_buffer_is_rejected() {
        let buffer = CString::new(vec![0x66, 0x6F, 0xFF]).unwrap();

        let result = PlatformString::from_buffer(&buffer);

        assert_eq!(result, Err(EncodingError::InvalidUtf8 { valid_up_to: 2 }));
    }

    #[test]
    fn test_empty_string_converts_to_empty_buffer() {
        let buffer = PlatformString::new().to_buffer().unwrap();
        assert!(buffer.as_bytes().is_empty());
    }

    #[test]
    fn test_platform_string_serializes_as_json_string() {
        let platform = PlatformString::from("result-data");

        let json = serde_json::to_string(&platform).unwrap();
        let back: PlatformString = serde_json::from_str(&json).unwrap();

        assert_eq!(json, "\"result-data\"");
        assert_eq!(back, platform);
    }

    #[test]
    fn test_unpaired_surrogate_fails_to_serialize() {
        let platform = PlatformString::from_units(vec![0xDC00]);
        assert!(serde_json::to_string(&platform).is_err());
    }
}

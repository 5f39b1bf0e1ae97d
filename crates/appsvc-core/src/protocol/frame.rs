//! JSON-lines frames for the TCP app-service transport.
//!
//! Wire format: one JSON object per line, UTF-8, terminated by `\n`.
//! The `"kind"` field selects the variant:
//!
//! ```json
//! {"kind":"open","service":"com.example.bridge","package":"Example_abc123"}
//! {"kind":"open_status","status":"success"}
//! {"kind":"request","id":7,"message":{"method":"echo","input":"hi","ui":"w1"}}
//! {"kind":"response","id":7,"status":"success","message":{"ack":"hi"}}
//! {"kind":"closed","reason":"completed"}
//! ```
//!
//! Either peer may send `request` frames after the channel opens.  The `id`
//! is chosen by the sender and echoed in the matching `response`; ids from
//! the two directions live in separate spaces.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::messages::ValueSet;

/// Result of an open attempt, as reported by the service host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenStatus {
    Success,
    AppNotInstalled,
    AppUnavailable,
    AppServiceUnavailable,
    NotAuthorized,
    Unknown,
}

/// Delivery status of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Failure,
    ResourceLimitsExceeded,
    Unknown,
}

/// Why the channel closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedStatus {
    Completed,
    Canceled,
    ResourceLimitsExceeded,
    Unknown,
}

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Client asks the host to open the named service.
    Open { service: String, package: String },
    /// Host answers an `Open`.
    OpenStatus { status: OpenStatus },
    /// A message that expects a `Response` with the same id.
    Request { id: u64, message: ValueSet },
    /// Answer to a `Request`.
    Response {
        id: u64,
        status: ResponseStatus,
        message: ValueSet,
    },
    /// The sender is closing the channel.
    Closed { reason: ClosedStatus },
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The line exceeded the configured maximum length.
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    TooLong { len: usize, max: usize },
}

/// Upper bound on a single frame, newline included.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Encodes a frame as one JSON line including the trailing `\n`.
///
/// # Errors
///
/// Returns [`FrameError::Json`] if a value in the frame has no UTF-8 form.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLong {
            len: bytes.len(),
            max: MAX_FRAME_LEN,
        });
    }
    Ok(bytes)
}

/// Decodes one frame from a line (with or without its trailing newline).
///
/// # Errors
///
/// Returns [`FrameError`] if the line is oversized or not a valid frame.
pub fn decode_frame(line: &[u8]) -> Result<Frame, FrameError> {
    if line.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLong {
            len: line.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let trimmed = line.strip_suffix(b"\n").unwrap_or(line);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    Ok(serde_json::from_slice(trimmed)?)
}

/// Splits complete lines off the front of a receive buffer.
///
/// Returns the decoded frames and leaves any trailing partial line in `buf`.
/// Stops at the first malformed line and returns its error; the bad line is
/// consumed so the caller may choose to continue.
pub fn drain_frames(buf: &mut Vec<u8>) -> (Vec<Frame>, Option<FrameError>) {
    let mut frames = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        match decode_frame(&line) {
            Ok(frame) => frames.push(frame),
            Err(e) => return (frames, Some(e)),
        }
    }
    if buf.len() > MAX_FRAME_LEN {
        let len = buf.len();
        buf.clear();
        return (
            frames,
            Some(FrameError::TooLong {
                len,
                max: MAX_FRAME_LEN,
            }),
        );
    }
    (frames, None)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

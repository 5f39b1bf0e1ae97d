//! Protocol module: the encoded call string, return messages, value sets,
//! transport frames and frame id allocation.

pub mod envelope;
pub mod frame;
pub mod messages;
pub mod sequence;

pub use envelope::{CallEnvelope, EnvelopeError, FIELD_DELIMITER};
pub use frame::{
    decode_frame, drain_frames, encode_frame, ClosedStatus, Frame, FrameError, OpenStatus,
    ResponseStatus,
};
pub use messages::*;
pub use sequence::FrameIdCounter;

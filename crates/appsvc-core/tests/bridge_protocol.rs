//! Integration tests for the appsvc-core public API.
//!
//! These tests follow a call and a return across both boundaries the bridge
//! deals with: the platform value set (UTF-16 strings) and the native buffer
//! (NUL-terminated UTF-8), exercising envelope, text conversion, messages and
//! frames together.

use appsvc_core::protocol::messages::{decode_request, encode_request, keys};
use appsvc_core::protocol::{decode_frame, encode_frame, Frame, ResponseStatus};
use appsvc_core::{CallEnvelope, PlatformString, ReturnMessage};

/// Sends a call from the platform side to the native side and back.
fn platform_to_native_and_back(call: &CallEnvelope) -> CallEnvelope {
    let request = encode_request(call);
    let decoded = decode_request(&request).expect("request must decode");
    let buffer = PlatformString::from(decoded.encode())
        .to_buffer()
        .expect("call must fit in a native buffer");
    let text = buffer.to_str().expect("buffer is UTF-8");
    CallEnvelope::decode(text).expect("encoded call must decode")
}

#[test]
fn test_ascii_calls_survive_the_full_path() {
    let samples = [
        ("echo", "hello", "ui1"),
        ("ping", "", ""),
        ("render", "a|b|c", "window-7"),
        ("set", "key=value; other=1", "0"),
    ];

    for (method, input, ui) in samples {
        let call = CallEnvelope::new(method, input, ui).unwrap();
        assert_eq!(platform_to_native_and_back(&call), call);
    }
}

#[test]
fn test_utf8_calls_survive_the_full_path() {
    let samples = [
        ("grüßen", "¡hola!", "fenêtre"),
        ("emoji", "🌍🚀 with | pipe", "😀"),
        ("cjk", "漢字かなカナ", "窓"),
    ];

    for (method, input, ui) in samples {
        let call = CallEnvelope::new(method, input, ui).unwrap();
        assert_eq!(platform_to_native_and_back(&call), call);
    }
}

#[test]
fn test_return_travels_inside_a_request_frame() {
    // Arrange: a successful return for request req-42
    let ret = ReturnMessage::from_parts("req-42", "result-data", "").unwrap();
    let frame = Frame::Request {
        id: 3,
        message: ret.to_value_set(),
    };

    // Act
    let decoded = decode_frame(&encode_frame(&frame).unwrap()).unwrap();

    // Assert
    let Frame::Request { id, message } = decoded else {
        panic!("expected a request frame");
    };
    assert_eq!(id, 3);
    assert_eq!(message.get_text(keys::RETURN_ID).unwrap().as_deref(), Some("req-42"));
    assert_eq!(message.get_text(keys::RESULT).unwrap().as_deref(), Some("result-data"));
    assert_eq!(message.get_text(keys::ERROR).unwrap().as_deref(), Some(""));
}

#[test]
fn test_response_frame_preserves_ack() {
    let frame = Frame::Response {
        id: 11,
        status: ResponseStatus::Success,
        message: appsvc_core::ValueSet::new().with(keys::ACK, "ack"),
    };

    let decoded = decode_frame(&encode_frame(&frame).unwrap()).unwrap();

    assert_eq!(decoded, frame);
}

//! JSON framing for the control channel.
//!
//! The wire transport is WebSocket text frames: one self-delimited JSON
//! object per frame, each decoding to one [`Envelope`]. There is no length
//! prefix — the WebSocket framing already delimits messages — but frames are
//! still size-checked against [`MAX_FRAME_BYTES`] before decoding.

use crate::error::{OnlineError, OnlineResult};
use crate::messages::Envelope;

/// Default maximum size of a single control-channel frame (16 MiB).
///
/// A frame larger than this is rejected with `FrameTooLarge` and the
/// session is closed — this bounds request/response bodies too, since they
/// travel base64-encoded inside a `Request`/`Response` envelope.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// The outcome of decoding one control-channel frame.
#[derive(Debug)]
pub enum DecodedFrame {
    /// A recognized envelope.
    Known(Envelope),
    /// A well-formed JSON object whose `type` field isn't one we recognize.
    ///
    /// Forward-compatible: the caller logs and skips these, except during
    /// the `Register` handshake, where any non-`Register` first frame is a
    /// protocol error.
    Unknown(String),
}

/// The full set of recognized envelope type tags, matching [`Envelope`]'s
/// `#[serde(rename_all = "snake_case")]` variant names.
const KNOWN_TYPES: &[&str] = &[
    "register", "registered", "request", "response", "error", "ping", "pong",
];

/// Encode an envelope as a JSON string suitable for one WebSocket text frame.
pub fn encode_envelope(env: &Envelope) -> OnlineResult<String> {
    Ok(serde_json::to_string(env)?)
}

/// Decode one frame's raw bytes, enforcing `max_frame_bytes` and forward
/// compatibility with unknown `type` tags.
pub fn decode_frame(data: &[u8], max_frame_bytes: usize) -> OnlineResult<DecodedFrame> {
    if data.len() > max_frame_bytes {
        return Err(OnlineError::FrameTooLarge(data.len(), max_frame_bytes));
    }

    let value: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| OnlineError::Protocol(format!("invalid JSON frame: {e}")))?;

    let type_tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| OnlineError::Protocol("frame missing \"type\" field".into()))?;

    if !KNOWN_TYPES.contains(&type_tag) {
        return Ok(DecodedFrame::Unknown(type_tag.to_string()));
    }

    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|e| OnlineError::Protocol(format!("malformed {type_tag} envelope: {e}")))?;
    Ok(DecodedFrame::Known(envelope))
}

/// Decode the very first frame of a control channel, enforcing the
/// handshake rule: it must be `Register`, or the session is a protocol
/// error regardless of whether the type tag is otherwise recognized.
pub fn decode_handshake_frame(data: &[u8], max_frame_bytes: usize) -> OnlineResult<()> {
    match decode_frame(data, max_frame_bytes)? {
        DecodedFrame::Known(Envelope::Register) => Ok(()),
        DecodedFrame::Known(other) => Err(OnlineError::Protocol(format!(
            "expected register as first frame, got {}",
            other.kind()
        ))),
        DecodedFrame::Unknown(tag) => Err(OnlineError::Protocol(format!(
            "expected register as first frame, got unknown type {tag}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_registered() {
        let env = Envelope::Registered {
            client_id: "c1".into(),
            public_port: 5000,
        };
        let encoded = encode_envelope(&env).unwrap();
        match decode_frame(encoded.as_bytes(), DEFAULT_MAX_FRAME_BYTES).unwrap() {
            DecodedFrame::Known(Envelope::Registered { client_id, public_port }) => {
                assert_eq!(client_id, "c1");
                assert_eq!(public_port, 5000);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let big = vec![b'a'; 32];
        let err = decode_frame(&big, 16).unwrap_err();
        assert!(matches!(err, OnlineError::FrameTooLarge(32, 16)));
    }

    #[test]
    fn unknown_type_is_skippable() {
        let frame = br#"{"type":"future_feature","stuff":1}"#;
        match decode_frame(frame, DEFAULT_MAX_FRAME_BYTES).unwrap() {
            DecodedFrame::Unknown(tag) => assert_eq!(tag, "future_feature"),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn handshake_rejects_non_register_first_frame() {
        let frame = br#"{"type":"ping"}"#;
        let err = decode_handshake_frame(frame, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
        assert!(matches!(err, OnlineError::Protocol(_)));
    }

    #[test]
    fn handshake_rejects_unknown_first_frame() {
        let frame = br#"{"type":"mystery"}"#;
        let err = decode_handshake_frame(frame, DEFAULT_MAX_FRAME_BYTES).unwrap_err();
        assert!(matches!(err, OnlineError::Protocol(_)));
    }

    #[test]
    fn handshake_accepts_register() {
        let frame = br#"{"type":"register"}"#;
        decode_handshake_frame(frame, DEFAULT_MAX_FRAME_BYTES).unwrap();
    }
}

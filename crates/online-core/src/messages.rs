//! Control-channel envelope types.
//!
//! One JSON object per WebSocket text frame. `type` is the tag; the rest of
//! the object is the envelope's fields, matching the schema in the external
//! interface contract. Field names are lowercase to match the wire exactly.

use serde::{Deserialize, Serialize};

/// A single HTTP header as an ordered `(name, value)` pair.
///
/// Modelled as a pair rather than folded into a map because HTTP allows
/// repeated header names (e.g. multiple `Set-Cookie`) and preserves order.
pub type HeaderPair = (String, String);

/// One control-channel message.
///
/// `#[serde(tag = "type")]` makes every variant serialize as a flat JSON
/// object with a `type` field plus its own fields alongside — not nested
/// under a payload key — matching the envelope schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First message on every control channel, client to server.
    Register,

    /// Reply to `Register`: assigns the client its id and public port.
    Registered {
        client_id: String,
        public_port: u16,
    },

    /// Server to client: an inbound public HTTP request to serve locally.
    Request {
        request_id: String,
        method: String,
        /// Request-target including query string, forwarded verbatim.
        path: String,
        headers: Vec<HeaderPair>,
        /// Base64-encoded body; empty string for an empty body.
        body_b64: String,
    },

    /// Client to server: the local service's response to a `Request`.
    Response {
        request_id: String,
        status: u16,
        headers: Vec<HeaderPair>,
        body_b64: String,
    },

    /// Either direction: a recoverable or terminal protocol-level error.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: String,
        message: String,
    },

    /// Either direction: liveness probe.
    Ping,

    /// Either direction: reply to `Ping`.
    Pong,
}

impl Envelope {
    /// Short name for logging, independent of payload contents.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Register => "register",
            Envelope::Registered { .. } => "registered",
            Envelope::Request { .. } => "request",
            Envelope::Response { .. } => "response",
            Envelope::Error { .. } => "error",
            Envelope::Ping => "ping",
            Envelope::Pong => "pong",
        }
    }

    pub fn error(request_id: Option<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Envelope::Error {
            request_id,
            code: code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_round_trips_with_bare_type_tag() {
        let json = serde_json::to_string(&Envelope::Register).unwrap();
        assert_eq!(json, r#"{"type":"register"}"#);
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Envelope::Register));
    }

    #[test]
    fn request_preserves_header_order_and_duplicates() {
        let env = Envelope::Request {
            request_id: "abc".into(),
            method: "GET".into(),
            path: "/x?y=1".into(),
            headers: vec![
                ("Set-Cookie".into(), "a=1".into()),
                ("Set-Cookie".into(), "b=2".into()),
            ],
            body_b64: String::new(),
        };
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        match back {
            Envelope::Request { headers, .. } => {
                assert_eq!(
                    headers,
                    vec![
                        ("Set-Cookie".to_string(), "a=1".to_string()),
                        ("Set-Cookie".to_string(), "b=2".to_string()),
                    ]
                );
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_field_fails_to_parse() {
        let err = serde_json::from_str::<Envelope>(r#"{"type":"bogus"}"#);
        assert!(err.is_err());
    }
}

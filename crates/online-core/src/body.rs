//! Base64 transport of request/response bodies.
//!
//! Binary bodies travel as base64 text inside `body_b64`; an empty body is
//! the empty string, not an absent field.

use crate::error::{OnlineError, OnlineResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

pub fn encode_body(body: &[u8]) -> String {
    if body.is_empty() {
        String::new()
    } else {
        STANDARD.encode(body)
    }
}

pub fn decode_body(body_b64: &str) -> OnlineResult<Vec<u8>> {
    if body_b64.is_empty() {
        return Ok(Vec::new());
    }
    STANDARD
        .decode(body_b64)
        .map_err(|e| OnlineError::Protocol(format!("invalid base64 body: {e}")))
}

/// Header names that are meaningful only on a single connection (RFC 7230
/// §6.1) and must not be forwarded across the tunnel in either direction.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "upgrade",
    "transfer-encoding",
    "te",
    "trailer",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
];

/// Whether `name` (case-insensitive) is a hop-by-hop header that should be
/// stripped before forwarding.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Filter out hop-by-hop headers from an ordered header list, preserving
/// order and duplicates of everything else.
pub fn strip_hop_by_hop(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_round_trips_to_empty_string() {
        assert_eq!(encode_body(&[]), "");
        assert_eq!(decode_body("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn binary_body_round_trips() {
        let body = b"{\"a\":1}\x00\xff";
        let encoded = encode_body(body);
        assert_eq!(decode_body(&encoded).unwrap(), body);
    }

    #[test]
    fn invalid_base64_is_an_error() {
        assert!(decode_body("not!!valid==base64").is_err());
    }

    #[test]
    fn strips_hop_by_hop_headers_preserving_order() {
        let headers = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("X-Request-Id".to_string(), "1".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
        ];
        let stripped = strip_hop_by_hop(headers);
        assert_eq!(
            stripped,
            vec![
                ("Host".to_string(), "example.com".to_string()),
                ("X-Request-Id".to_string(), "1".to_string()),
            ]
        );
    }
}

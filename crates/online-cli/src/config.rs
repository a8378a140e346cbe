//! CLI-level configuration helpers: environment variable fallback and
//! `--server` URL normalization.

/// How many consecutive failures to tolerate before the *first* successful
/// registration before giving up (`spec.md` §6 exit code 2, "persistent
/// connection failure after giving up"). Once a session has registered at
/// least once, `online-client::forwarder::run` retries indefinitely
/// regardless of this bound — see that module's doc comment.
pub const MAX_INITIAL_ATTEMPTS: u32 = 6;

/// `ONLINE_SERVER` environment variable, falling back to the local
/// default control-channel address when unset.
pub fn default_server_from_env() -> String {
    std::env::var("ONLINE_SERVER").unwrap_or_else(|_| "127.0.0.1:8765".to_string())
}

/// Normalize a user-supplied `--server` value into a full `ws://.../ws`
/// control-channel URL: adds a `ws://` scheme and a `/ws` path when the
/// caller passed a bare `host[:port]`, and leaves an explicit `ws://` or
/// `wss://` URL (with its own path) untouched.
pub fn normalize_server_url(input: &str) -> Result<String, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty server address".to_string());
    }

    let (scheme, rest) = if let Some(rest) = trimmed.strip_prefix("ws://") {
        ("ws://", rest)
    } else if let Some(rest) = trimmed.strip_prefix("wss://") {
        ("wss://", rest)
    } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Err("use ws:// or wss://, not an http(s) URL".to_string());
    } else {
        ("ws://", trimmed)
    };

    if rest.is_empty() {
        return Err("missing host".to_string());
    }

    let url = if rest.contains('/') {
        format!("{scheme}{rest}")
    } else {
        format!("{scheme}{rest}/ws")
    };

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_port_gets_scheme_and_path() {
        assert_eq!(normalize_server_url("127.0.0.1:8765").unwrap(), "ws://127.0.0.1:8765/ws");
    }

    #[test]
    fn explicit_scheme_and_path_are_untouched() {
        assert_eq!(
            normalize_server_url("wss://tunnel.example.com/ws").unwrap(),
            "wss://tunnel.example.com/ws"
        );
    }

    #[test]
    fn explicit_scheme_without_path_gets_ws_suffix() {
        assert_eq!(normalize_server_url("ws://tunnel.example.com:9000").unwrap(), "ws://tunnel.example.com:9000/ws");
    }

    #[test]
    fn rejects_http_scheme() {
        assert!(normalize_server_url("http://tunnel.example.com").is_err());
    }

    #[test]
    fn rejects_empty_input() {
        assert!(normalize_server_url("").is_err());
        assert!(normalize_server_url("ws://").is_err());
    }
}

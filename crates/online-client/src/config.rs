//! Forwarder configuration.
//!
//! Resolved once at startup from CLI flags (`online-cli`'s job); this crate
//! only defines the shape and its defaults.

use std::time::Duration;

/// How long the forwarder waits for the local service to answer one
/// request before reporting it back to the server as a local failure
/// (`spec.md` §4.6).
pub fn default_local_request_timeout() -> Duration {
    Duration::from_secs(30)
}

/// How often the forwarder sends an unsolicited `Ping` on an otherwise
/// idle control channel (`spec.md` §4.6).
pub fn default_ping_interval() -> Duration {
    Duration::from_secs(20)
}

/// Consecutive missed pongs before the control channel is considered dead
/// and torn down (`spec.md` §4.6: "missing three consecutive expected
/// pongs").
pub const MAX_MISSED_PONGS: u32 = 3;

/// Resolved configuration for one forwarder run.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control-channel WebSocket URL, e.g. `ws://tunnel.example.com:8765/ws`.
    pub server_url: String,
    /// Base URL of the local service requests are forwarded to, e.g.
    /// `http://127.0.0.1:9100`.
    pub local_base_url: String,
    /// Timeout for the forwarder's local HTTP call.
    pub local_request_timeout: Duration,
    /// Heartbeat interval for the control channel.
    pub ping_interval: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, local_port: u16, local_host: &str) -> Self {
        Self {
            server_url: server_url.into(),
            local_base_url: format!("http://{local_host}:{local_port}"),
            local_request_timeout: default_local_request_timeout(),
            ping_interval: default_ping_interval(),
        }
    }

    pub fn with_local_request_timeout(mut self, timeout: Duration) -> Self {
        self.local_request_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_local_base_url_from_port_and_host() {
        let cfg = ClientConfig::new("ws://example.com:8765/ws", 9100, "127.0.0.1");
        assert_eq!(cfg.local_base_url, "http://127.0.0.1:9100");
        assert_eq!(cfg.ping_interval, default_ping_interval());
    }
}

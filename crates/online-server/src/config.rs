//! Server configuration: TOML file + environment + CLI overrides.
//!
//! Precedence is CLI flags > environment variables > config file > built-in
//! defaults, mirroring the layered config style of comparable tunnel/relay
//! servers in the corpus. Flag and environment variable names follow
//! `spec.md` §6 literally (`--listen`, `--port-range`, `--request-timeout`,
//! `--max-clients`, `ONLINE_LISTEN`, `ONLINE_PORT_MIN`, `ONLINE_PORT_MAX`,
//! `ONLINE_REQUEST_TIMEOUT`); `public_bind_host`, `max_request_body_bytes`,
//! and `shutdown_grace` are ambient additions spec.md leaves implicit (see
//! `DESIGN.md`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use online_core::{OnlineError, OnlineResult};

use crate::port_allocator::PortRange;
use crate::public_listener::DEFAULT_MAX_REQUEST_BODY_BYTES;

fn default_listen() -> String {
    "0.0.0.0:8765".to_string()
}
fn default_public_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port_min() -> u16 {
    20000
}
fn default_port_max() -> u16 {
    20100
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_clients() -> usize {
    100
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_max_request_body_bytes() -> usize {
    DEFAULT_MAX_REQUEST_BODY_BYTES
}

/// `[server]` section of the TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_public_bind_host")]
    pub public_bind_host: String,
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            public_bind_host: default_public_bind_host(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            request_timeout_secs: default_request_timeout_secs(),
            max_clients: default_max_clients(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            max_request_body_bytes: default_max_request_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
}

/// CLI overrides threaded through to [`ServerConfig::load`]. `None` means
/// "not passed on the command line, fall through to env/file/default".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub public_bind_host: Option<String>,
    /// `--port-range MIN-MAX`, parsed by the caller into a [`PortRange`].
    pub port_range: Option<PortRange>,
    pub request_timeout_secs: Option<u64>,
    pub max_clients: Option<usize>,
    pub shutdown_grace_secs: Option<u64>,
    pub max_request_body_bytes: Option<usize>,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub public_bind_host: String,
    pub port_range: PortRange,
    pub request_timeout: Duration,
    pub max_clients: usize,
    pub shutdown_grace: Duration,
    pub max_request_body_bytes: usize,
}

impl ServerConfig {
    pub fn control_bind_addr(&self) -> SocketAddr {
        self.listen
    }

    /// Load configuration: TOML file, then `ONLINE_*` environment
    /// variables, then CLI flags, each layer overriding the last.
    ///
    /// The port range is the one field spec.md splits across two env vars
    /// (`ONLINE_PORT_MIN`, `ONLINE_PORT_MAX`) but a single CLI flag
    /// (`--port-range MIN-MAX`): both env vars must be set to override the
    /// file/default range, matching the asymmetry in §6 as written.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> OnlineResult<Self> {
        let file = if let Some(path) = config_path {
            if path.exists() {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| OnlineError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let env_str = |key: &str| std::env::var(key).ok();
        let env_u64 = |key: &str| std::env::var(key).ok().and_then(|v| v.parse().ok());
        let env_usize = |key: &str| std::env::var(key).ok().and_then(|v| v.parse().ok());
        let env_u16 = |key: &str| std::env::var(key).ok().and_then(|v| v.parse().ok());

        let listen = cli
            .listen
            .or_else(|| env_str("ONLINE_LISTEN"))
            .unwrap_or(file.server.listen);
        let public_bind_host = cli
            .public_bind_host
            .or_else(|| env_str("ONLINE_PUBLIC_BIND_HOST"))
            .unwrap_or(file.server.public_bind_host);

        let port_range = match cli.port_range {
            Some(range) => range,
            None => match (env_u16("ONLINE_PORT_MIN"), env_u16("ONLINE_PORT_MAX")) {
                (Some(min), Some(max)) => try_port_range(min, max)?,
                _ => try_port_range(file.server.port_min, file.server.port_max)?,
            },
        };

        let request_timeout_secs = cli
            .request_timeout_secs
            .or_else(|| env_u64("ONLINE_REQUEST_TIMEOUT"))
            .unwrap_or(file.server.request_timeout_secs);
        let max_clients = cli
            .max_clients
            .or_else(|| env_usize("ONLINE_MAX_CLIENTS"))
            .unwrap_or(file.server.max_clients);
        let shutdown_grace_secs = cli
            .shutdown_grace_secs
            .or_else(|| env_u64("ONLINE_SHUTDOWN_GRACE_SECS"))
            .unwrap_or(file.server.shutdown_grace_secs);
        let max_request_body_bytes = cli
            .max_request_body_bytes
            .or_else(|| env_usize("ONLINE_MAX_REQUEST_BODY_BYTES"))
            .unwrap_or(file.server.max_request_body_bytes);

        let listen: SocketAddr = listen
            .parse()
            .map_err(|e| OnlineError::Other(format!("invalid listen address {listen:?}: {e}")))?;

        Ok(Self {
            listen,
            public_bind_host,
            port_range,
            request_timeout: Duration::from_secs(request_timeout_secs),
            max_clients,
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            max_request_body_bytes,
        })
    }
}

/// Build a [`PortRange`] from env-var or config-file bounds, validating
/// `min <= max` instead of going through `PortRange::new`'s `assert!`.
///
/// The `--port-range` CLI flag already validates via `PortRange::from_str`
/// (`port_allocator.rs`); this gives the env-var and file sources the same
/// `Err` path instead of letting an inverted pair panic the whole process
/// during `ServerConfig::load` (`spec.md` §6/§8: a bad range is a config
/// error, exit code 1, not a crash).
fn try_port_range(min: u16, max: u16) -> OnlineResult<PortRange> {
    if min > max {
        return Err(OnlineError::Other(format!(
            "invalid port range: min ({min}) must be <= max ({max})"
        )));
    }
    Ok(PortRange::new(min, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_port_range_accepts_min_equal_max() {
        let range = try_port_range(5000, 5000).unwrap();
        assert_eq!(range, PortRange::new(5000, 5000));
    }

    #[test]
    fn try_port_range_rejects_inverted_bounds_without_panicking() {
        let err = try_port_range(6000, 5000).unwrap_err();
        assert!(matches!(err, OnlineError::Other(_)));
    }
}

/// Expand `~` to the user's home directory, mirroring the teacher's own
/// config-path handling.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.into_owned())
}

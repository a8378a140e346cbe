use thiserror::Error;

/// Errors produced by the tunnel protocol layer.
///
/// Each variant corresponds to one entry of the error taxonomy: a failure
/// scoped to a single request fails only that request; a failure scoped to
/// the control channel tears down the whole session.
#[derive(Debug, Error)]
pub enum OnlineError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),

    #[error("no public port available")]
    NoPortAvailable,

    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("upstream timeout")]
    UpstreamTimeout,

    #[error("session closed")]
    SessionClosed,

    #[error("local server error: {0}")]
    LocalServerError(String),

    #[error("payload too large: {0} bytes (max {1})")]
    PayloadTooLarge(usize, usize),

    #[error("bad public request: {0}")]
    BadPublicRequest(String),

    #[error("heartbeat lost")]
    Heartbeat,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for OnlineError {
    fn from(e: serde_json::Error) -> Self {
        OnlineError::Codec(e.to_string())
    }
}

pub type OnlineResult<T> = Result<T, OnlineError>;

/// Stable error codes carried on the wire in `error` envelopes — distinct
/// from the Rust-side [`OnlineError`] variants, though each wire code maps
/// to exactly one variant above.
pub mod codes {
    pub const PROTOCOL_ERROR: &str = "protocol_error";
    pub const FRAME_TOO_LARGE: &str = "frame_too_large";
    pub const NO_PORT: &str = "no_port";
    pub const BIND_FAILED: &str = "bind_failed";
    pub const UPSTREAM_TIMEOUT: &str = "upstream_timeout";
    pub const SESSION_CLOSED: &str = "session_closed";
    pub const HEARTBEAT: &str = "heartbeat";
}

impl OnlineError {
    /// The wire-level error code for this error, if it has one (some errors
    /// are purely local and never serialized into an `Error` envelope).
    pub fn wire_code(&self) -> &'static str {
        match self {
            OnlineError::Protocol(_) => codes::PROTOCOL_ERROR,
            OnlineError::FrameTooLarge(..) => codes::FRAME_TOO_LARGE,
            OnlineError::NoPortAvailable => codes::NO_PORT,
            OnlineError::BindFailed(_) => codes::BIND_FAILED,
            OnlineError::UpstreamTimeout => codes::UPSTREAM_TIMEOUT,
            OnlineError::SessionClosed => codes::SESSION_CLOSED,
            OnlineError::Heartbeat => codes::HEARTBEAT,
            _ => "error",
        }
    }
}

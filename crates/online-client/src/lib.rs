//! online-client: the reverse tunnel's client-side forwarder.
//!
//! Maintains a persistent control-channel connection to an `online-server`,
//! and for every `Request` envelope it receives, issues the equivalent HTTP
//! request against a local service and reports back a `Response` envelope.
//! Reconnects with jittered exponential backoff whenever the control
//! channel is lost; a fresh `Register` is always sent on reconnect, so a
//! restarted session gets a new `client_id` (and possibly a new port).

pub mod config;
pub mod forwarder;
pub mod transport;

pub use config::ClientConfig;
pub use forwarder::{run, ForwarderEvent};

pub use online_core::{OnlineError, OnlineResult};

//! online-server: self-hosted HTTP reverse tunnel server.
//!
//! Accepts client control-channel connections over WebSocket, allocates a
//! public port per client, and multiplexes inbound public HTTP requests
//! back down the control channel for the client to answer. The `online-server`
//! binary (`src/main.rs`) is a thin CLI wrapper around this library so that
//! integration tests (`tests/`) can drive a real [`OnlineServer`] in-process.

pub mod config;
pub mod correlation;
pub mod port_allocator;
pub mod public_listener;
pub mod server;
pub mod session;
pub mod transport;

pub use config::{CliOverrides, ServerConfig};
pub use server::OnlineServer;

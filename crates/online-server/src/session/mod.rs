//! Session management: the per-client session table and its state machine.

pub mod manager;

pub use manager::{Session, SessionInfo, SessionManager, SessionState};

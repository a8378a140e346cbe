//! Transport layer: the control-channel WebSocket listener.

pub mod websocket;

//! online-core: shared protocol library for the `online` reverse tunnel.
//!
//! Provides the control-channel envelope types, JSON frame codec, and the
//! base64/hop-by-hop header helpers shared between the server's public HTTP
//! listener and the client's forwarder.

pub mod body;
pub mod codec;
pub mod error;
pub mod messages;

pub use body::{decode_body, encode_body, is_hop_by_hop, strip_hop_by_hop, HOP_BY_HOP_HEADERS};
pub use codec::{decode_frame, decode_handshake_frame, encode_envelope, DecodedFrame, DEFAULT_MAX_FRAME_BYTES};
pub use error::{OnlineError, OnlineResult};
pub use messages::{Envelope, HeaderPair};

//! Client side of the control-channel WebSocket transport.
//!
//! Mirrors `online-server`'s `transport::websocket` module: thin send/recv
//! helpers over `tokio-tungstenite`, with framing and the `register`
//! handshake left to `forwarder.rs`.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use online_core::{OnlineError, OnlineResult};

pub type ControlStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect the control channel to the server's `/ws` endpoint.
///
/// `server_url` is a full `ws://`/`wss://` URL; if the caller passed a bare
/// `host:port`, `online-cli` normalizes it to `ws://host:port/ws` before
/// calling in.
pub async fn connect(server_url: &str) -> OnlineResult<ControlStream> {
    let (stream, _response) = tokio_tungstenite::connect_async(server_url)
        .await
        .map_err(|e| OnlineError::Other(format!("failed to connect to {server_url}: {e}")))?;
    Ok(stream)
}

/// Send a JSON-encoded envelope as one text frame.
pub async fn send_text(ws: &mut ControlStream, text: String) -> OnlineResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| OnlineError::Other(format!("control send failed: {e}")))
}

/// Receive the next text frame's raw contents, or `None` on a clean close.
///
/// Answers transport-level pings automatically; non-text data frames are
/// ignored since the control protocol is JSON-over-text only.
pub async fn recv_text(ws: &mut ControlStream) -> OnlineResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(OnlineError::Other(format!("control recv failed: {e}"))),
            None => return Ok(None),
        }
    }
}

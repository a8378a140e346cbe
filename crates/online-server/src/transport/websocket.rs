//! WebSocket control-channel listener using tokio-tungstenite.
//!
//! Accepts the plain-TCP `GET /ws` upgrade requests that clients use for
//! their control channel. Each accepted connection is handed off as a
//! [`WebSocketConnection`]; handshake (the first `register` envelope) and
//! framing live in `server.rs` and `online_core::codec` respectively, not
//! here — this module only owns the TCP accept loop and the raw text-frame
//! send/recv primitives.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use online_core::{OnlineError, OnlineResult};

/// A handle to an accepted, already-upgraded WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Bind the control-channel listener and spawn its accept loop.
///
/// Returns a receiver that yields one [`WebSocketConnection`] per completed
/// WS handshake; a bad handshake is logged and dropped, not surfaced to the
/// caller.
pub async fn start_listener(bind_addr: SocketAddr) -> OnlineResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| OnlineError::BindFailed(e.to_string()))?;

    info!(addr = %bind_addr, "control-channel listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "control WebSocket accepted");
                                let conn = WebSocketConnection { ws_stream, remote_addr: addr };
                                if tx.send(conn).await.is_err() {
                                    warn!("control connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "control listener accept failed");
                }
            }
        }
    });

    Ok(rx)
}

/// Send a JSON-encoded envelope as a text frame.
pub async fn ws_send_text(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    text: String,
) -> OnlineResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| OnlineError::Other(format!("WS send failed: {e}")))
}

/// Receive the next text frame's raw bytes, or `None` on a clean close.
///
/// Pings are answered automatically by replying with a matching pong;
/// binary and other non-text frames are ignored (the control protocol is
/// JSON-over-text only).
pub async fn ws_recv_text(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
) -> OnlineResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(OnlineError::Other(format!("WS recv failed: {e}"))),
            None => return Ok(None),
        }
    }
}

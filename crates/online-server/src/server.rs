//! Core server: accepts control-channel connections and dispatches frames.
//!
//! Owns the session manager and the control-channel listener. Each accepted
//! WebSocket connection goes through a handshake (first frame must be
//! `register`), then gets its own session, public listener, and pair of
//! read/write loops for the lifetime of the tunnel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use online_core::messages::Envelope;
use online_core::{decode_frame, decode_handshake_frame, encode_envelope, DecodedFrame};

use crate::config::ServerConfig;
use crate::public_listener;
use crate::session::{Session, SessionManager};
use crate::transport::websocket::{self, WebSocketConnection};

/// How often the background task sweeps for timed-out requests.
///
/// `spec.md` §8 S4 requires a `504` within 1.5s of a 1s configured
/// `request_timeout`; since the reap sweep is the only thing that retires a
/// stale waiter, the worst-case latency is `request_timeout + REAP_INTERVAL`
/// and must stay well under that 500ms budget.
const REAP_INTERVAL: Duration = Duration::from_millis(100);
/// How often the background task logs per-session diagnostics via
/// `SessionManager::list` — mirrors the teacher's `server.rs` 60s GC/idle-log
/// cadence (see `DESIGN.md`).
const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(60);
/// Bound on each session's outbound control-channel queue (`spec.md` §5).
const OUTBOUND_QUEUE_DEPTH: usize = 256;

pub struct OnlineServer {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
}

impl OnlineServer {
    pub fn new(config: ServerConfig) -> Self {
        let sessions = Arc::new(SessionManager::new(
            config.port_range,
            config.max_clients,
            config.public_bind_host.clone(),
        ));
        Self { config, sessions }
    }

    /// Run the control-channel listener and maintenance loop until the
    /// caller's future (normally a shutdown signal select) completes.
    pub async fn run(&self) -> online_core::OnlineResult<()> {
        let mut control_rx = websocket::start_listener(self.config.control_bind_addr()).await?;

        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                interval.tick().await;
                sessions.reap_expired_waiters().await;
            }
        });

        let diag_sessions = self.sessions.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DIAGNOSTICS_INTERVAL);
            loop {
                interval.tick().await;
                for s in diag_sessions.list().await {
                    debug!(
                        client_id = %s.client_id,
                        public_port = s.public_port,
                        state = ?s.state,
                        pending = s.pending_count,
                        age_secs = s.age_secs,
                        idle_secs = s.idle_secs,
                        "session diagnostics"
                    );
                }
            }
        });

        while let Some(conn) = control_rx.recv().await {
            let sessions = self.sessions.clone();
            let request_timeout = self.config.request_timeout;
            let max_body_bytes = self.config.max_request_body_bytes;
            tokio::spawn(async move {
                handle_control_connection(conn, sessions, request_timeout, max_body_bytes).await;
            });
        }

        Ok(())
    }

    /// Drain every session gracefully; used by `main.rs` on shutdown signal.
    pub async fn shutdown(&self) {
        self.sessions.shutdown(self.config.shutdown_grace).await;
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}

async fn handle_control_connection(
    mut conn: WebSocketConnection,
    sessions: Arc<SessionManager>,
    request_timeout: Duration,
    max_body_bytes: usize,
) {
    let remote = conn.remote_addr;

    let first_frame = match websocket::ws_recv_text(&mut conn.ws_stream).await {
        Ok(Some(text)) => text,
        Ok(None) => {
            debug!(%remote, "control connection closed before handshake");
            return;
        }
        Err(e) => {
            warn!(%remote, error = %e, "control connection read failed before handshake");
            return;
        }
    };

    if let Err(e) = decode_handshake_frame(first_frame.as_bytes(), online_core::DEFAULT_MAX_FRAME_BYTES) {
        warn!(%remote, error = %e, "rejected handshake: first frame was not register");
        let err_env = Envelope::error(None, e.wire_code().to_string(), e.to_string());
        if let Ok(text) = encode_envelope(&err_env) {
            let _ = websocket::ws_send_text(&mut conn.ws_stream, text).await;
        }
        return;
    }

    let client_id = Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE_DEPTH);

    let (session, listener_cancel_rx) = match sessions.register(client_id.clone(), outbound_tx).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%remote, client_id = %client_id, error = %e, "session registration failed");
            let err_env = Envelope::error(None, e.wire_code().to_string(), e.to_string());
            if let Ok(text) = encode_envelope(&err_env) {
                let _ = websocket::ws_send_text(&mut conn.ws_stream, text).await;
            }
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = futures_util::StreamExt::split(conn.ws_stream);

    let registered = Envelope::Registered { client_id: client_id.clone(), public_port: session.public_port };
    match encode_envelope(&registered) {
        Ok(text) => {
            if let Err(e) =
                futures_util::SinkExt::send(&mut ws_sink, tokio_tungstenite::tungstenite::Message::Text(text.into()))
                    .await
            {
                warn!(client_id = %client_id, error = %e, "failed to send registered envelope");
                sessions.close(&client_id, "failed to send registered").await;
                return;
            }
        }
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "failed to encode registered envelope");
            sessions.close(&client_id, "encode failure").await;
            return;
        }
    }

    sessions.mark_active(&client_id).await;
    info!(client_id = %client_id, public_port = session.public_port, %remote, "client registered");

    tokio::spawn(public_listener::run_accept_loop(
        session.clone(),
        listener_cancel_rx,
        request_timeout,
        max_body_bytes,
    ));

    let writer_client_id = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(env) = outbound_rx.recv().await {
            match encode_envelope(&env) {
                Ok(text) => {
                    if let Err(e) = futures_util::SinkExt::send(
                        &mut ws_sink,
                        tokio_tungstenite::tungstenite::Message::Text(text.into()),
                    )
                    .await
                    {
                        debug!(client_id = %writer_client_id, error = %e, "control write failed, stopping writer");
                        break;
                    }
                }
                Err(e) => {
                    warn!(client_id = %writer_client_id, error = %e, "failed to encode outbound envelope");
                }
            }
        }
    });

    loop {
        let msg = futures_util::StreamExt::next(&mut ws_stream).await;
        match msg {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                session.touch();
                dispatch_inbound_frame(&session, text.as_ref()).await;
            }
            Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => {
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(client_id = %client_id, error = %e, "control read failed");
                break;
            }
        }
    }

    writer.abort();
    sessions.close(&client_id, "control channel closed").await;
}

async fn dispatch_inbound_frame(session: &Arc<Session>, raw: &str) {
    match decode_frame(raw.as_bytes(), online_core::DEFAULT_MAX_FRAME_BYTES) {
        Ok(DecodedFrame::Known(Envelope::Response { request_id, status, headers, body_b64 })) => {
            match online_core::decode_body(&body_b64) {
                Ok(body) => session.pending.complete(&request_id, status, headers, body),
                Err(e) => session.pending.fail_protocol(&request_id, e.to_string()),
            }
        }
        Ok(DecodedFrame::Known(Envelope::Error { request_id, code, message })) => {
            if let Some(request_id) = request_id {
                session.pending.fail_protocol(&request_id, format!("{code}: {message}"));
            } else {
                warn!(client_id = %session.client_id, code, message, "client reported session-level error");
            }
        }
        Ok(DecodedFrame::Known(Envelope::Ping)) => {
            let _ = session.outbound_tx.send(Envelope::Pong).await;
        }
        Ok(DecodedFrame::Known(Envelope::Pong)) => {
            // Heartbeat acknowledgement only; `touch()` already ran above.
        }
        Ok(DecodedFrame::Known(other)) => {
            debug!(client_id = %session.client_id, kind = other.kind(), "ignoring out-of-place envelope on control channel");
        }
        Ok(DecodedFrame::Unknown(kind)) => {
            debug!(client_id = %session.client_id, kind, "skipping unknown envelope type");
        }
        Err(e) => {
            warn!(client_id = %session.client_id, error = %e, "malformed control frame");
        }
    }
}

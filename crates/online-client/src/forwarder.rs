//! The client forwarder (`spec.md` §4.6).
//!
//! Owns the control-channel connection's whole lifecycle: connect, send
//! `Register`, print the assigned public URL, forward every `Request` to
//! the configured local service, and reconnect with jittered exponential
//! backoff whenever the channel drops. A single task owns the WebSocket
//! send half — every other task (one per in-flight forwarded request, plus
//! the heartbeat ticker) hands frames to it through a bounded queue, the
//! same single-writer discipline `online-server` uses on its side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use online_core::messages::{Envelope, HeaderPair};
use online_core::{decode_body, decode_frame, encode_body, encode_envelope, strip_hop_by_hop, DecodedFrame};

use crate::config::{ClientConfig, MAX_MISSED_PONGS};
use crate::transport;

/// Bound on the outbound queue feeding the single control-channel writer.
const OUTBOUND_QUEUE_DEPTH: usize = 256;
/// Initial reconnect delay (`spec.md` §4.6: "0.5 s, 1 s, 2 s, …").
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Reconnect delay ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Observable lifecycle events, surfaced so `online-cli` can print progress
/// and tests can assert on behavior without scraping log output.
#[derive(Debug, Clone)]
pub enum ForwarderEvent {
    /// A control channel was established and the server assigned a port.
    Registered { client_id: String, public_port: u16 },
    /// The control channel was lost (or never connected) and a reconnect
    /// attempt will follow after `retry_in`.
    Disconnected { reason: String, retry_in: Duration },
}

/// Run the forwarder: connect, serve requests, and on any disconnection
/// reconnect with backoff. Per `spec.md` §7 the client retries the control
/// channel indefinitely once a session has ever been established, so this
/// only returns in one case: the channel has *never* successfully
/// registered and `max_initial_attempts` (if given) has been exhausted —
/// the CLI surfaces that as "persistent connection failure after giving
/// up" (exit code 2). Passing `max_initial_attempts: None` matches the
/// spec's literal "indefinitely" and never returns.
pub async fn run(
    config: ClientConfig,
    events: Option<mpsc::Sender<ForwarderEvent>>,
    max_initial_attempts: Option<u32>,
) -> Result<(), String> {
    let ever_registered = Arc::new(AtomicBool::new(false));
    let mut attempt: u32 = 0;
    loop {
        match run_once(&config, events.as_ref(), &ever_registered).await {
            Ok(()) => {
                // A clean server-initiated close; still reconnect per spec
                // ("the client retries its control channel indefinitely").
                attempt = 0;
            }
            Err(reason) => {
                if !ever_registered.load(Ordering::SeqCst) {
                    if let Some(max) = max_initial_attempts {
                        if attempt + 1 >= max {
                            return Err(reason);
                        }
                    }
                }
                let delay = next_backoff(attempt);
                warn!(error = %reason, retry_in = ?delay, "control channel lost, reconnecting");
                if let Some(tx) = &events {
                    let _ = tx
                        .send(ForwarderEvent::Disconnected { reason, retry_in: delay })
                        .await;
                }
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
        }
    }
}

/// Compute the jittered exponential backoff delay for reconnect attempt
/// `attempt` (0-indexed): `500ms * 2^attempt`, capped at 30s, ±25% jitter.
pub fn next_backoff(attempt: u32) -> Duration {
    let base = INITIAL_BACKOFF
        .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF);
    jitter(base)
}

fn jitter(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(0.75..=1.25);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Establish one control-channel connection and serve it until it closes
/// or errors. Returns `Ok(())` on a clean close, `Err(reason)` otherwise —
/// both cases make the caller reconnect.
async fn run_once(
    config: &ClientConfig,
    events: Option<&mpsc::Sender<ForwarderEvent>>,
    ever_registered: &AtomicBool,
) -> Result<(), String> {
    let mut ws = transport::connect(&config.server_url)
        .await
        .map_err(|e| e.to_string())?;

    let register = encode_envelope(&Envelope::Register).map_err(|e| e.to_string())?;
    transport::send_text(&mut ws, register).await.map_err(|e| e.to_string())?;

    let reply = transport::recv_text(&mut ws)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "control channel closed before registration reply".to_string())?;

    let (client_id, public_port) = match decode_frame(reply.as_bytes(), online_core::DEFAULT_MAX_FRAME_BYTES) {
        Ok(DecodedFrame::Known(Envelope::Registered { client_id, public_port })) => (client_id, public_port),
        Ok(DecodedFrame::Known(Envelope::Error { code, message, .. })) => {
            return Err(format!("registration rejected: {code}: {message}"));
        }
        Ok(other) => return Err(format!("unexpected registration reply: {other:?}")),
        Err(e) => return Err(format!("malformed registration reply: {e}")),
    };

    info!(client_id = %client_id, public_port, "registered with tunnel server");
    println!("Forwarding http://{}:{} -> {}", server_host(&config.server_url), public_port, config.local_base_url);
    ever_registered.store(true, Ordering::SeqCst);
    if let Some(tx) = events {
        let _ = tx
            .send(ForwarderEvent::Registered { client_id: client_id.clone(), public_port })
            .await;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE_DEPTH);
    let (mut sink, mut stream) = futures_util::StreamExt::split(ws);

    let writer = tokio::spawn(async move {
        while let Some(env) = outbound_rx.recv().await {
            match encode_envelope(&env) {
                Ok(text) => {
                    if futures_util::SinkExt::send(&mut sink, tokio_tungstenite::tungstenite::Message::Text(text.into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode outbound envelope"),
            }
        }
    });

    let mut last_pong_at = Instant::now();
    let mut ping_interval = tokio::time::interval(config.ping_interval);
    ping_interval.tick().await; // skip the immediate first tick

    let local_base_url = config.local_base_url.clone();
    let local_timeout = config.local_request_timeout;

    let result = loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong_at.elapsed() > config.ping_interval * MAX_MISSED_PONGS {
                    break Err("heartbeat lost: no pong in three consecutive intervals".to_string());
                }
                if outbound_tx.send(Envelope::Ping).await.is_err() {
                    break Err("outbound queue closed while sending ping".to_string());
                }
            }
            frame = futures_util::StreamExt::next(&mut stream) => {
                match frame {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        match decode_frame(text.as_bytes(), online_core::DEFAULT_MAX_FRAME_BYTES) {
                            Ok(DecodedFrame::Known(Envelope::Request { request_id, method, path, headers, body_b64 })) => {
                                let outbound_tx = outbound_tx.clone();
                                let local_base_url = local_base_url.clone();
                                tokio::spawn(async move {
                                    let response = forward_to_local(
                                        &local_base_url,
                                        &method,
                                        &path,
                                        headers,
                                        &body_b64,
                                        local_timeout,
                                    )
                                    .await;
                                    let _ = outbound_tx
                                        .send(Envelope::Response {
                                            request_id,
                                            status: response.status,
                                            headers: response.headers,
                                            body_b64: encode_body(&response.body),
                                        })
                                        .await;
                                });
                            }
                            Ok(DecodedFrame::Known(Envelope::Ping)) => {
                                let _ = outbound_tx.send(Envelope::Pong).await;
                            }
                            Ok(DecodedFrame::Known(Envelope::Pong)) => {
                                last_pong_at = Instant::now();
                            }
                            Ok(DecodedFrame::Known(Envelope::Error { code, message, .. })) => {
                                warn!(code, message, "server reported a session-level error");
                            }
                            Ok(DecodedFrame::Known(other)) => {
                                debug!(kind = other.kind(), "ignoring out-of-place envelope on control channel");
                            }
                            Ok(DecodedFrame::Unknown(kind)) => {
                                debug!(kind, "skipping unknown envelope type");
                            }
                            Err(e) => {
                                warn!(error = %e, "malformed control frame");
                            }
                        }
                    }
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => {
                        break Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        break Err(format!("control read failed: {e}"));
                    }
                }
            }
        }
    };

    drop(outbound_tx);
    writer.abort();
    result
}

/// A forwarded local HTTP response, always produced even on local failure
/// (`spec.md` §4.6 step 5 — the forwarder never crashes on one request).
struct LocalResponse {
    status: u16,
    headers: Vec<HeaderPair>,
    body: Vec<u8>,
}

async fn forward_to_local(
    local_base_url: &str,
    method: &str,
    path: &str,
    headers: Vec<HeaderPair>,
    body_b64: &str,
    request_timeout: Duration,
) -> LocalResponse {
    let body = match decode_body(body_b64) {
        Ok(b) => b,
        Err(e) => {
            return LocalResponse {
                status: 502,
                headers: vec![],
                body: format!("Local server error: invalid request body ({e})").into_bytes(),
            }
        }
    };

    let url = format!("{}{}", local_base_url.trim_end_matches('/'), path);
    let method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(_) => reqwest::Method::GET,
    };

    let client = match reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(request_timeout)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            return LocalResponse {
                status: 502,
                headers: vec![],
                body: format!("Local server error: {e}").into_bytes(),
            }
        }
    };

    let mut req = client.request(method, &url);
    for (name, value) in strip_hop_by_hop(headers) {
        req = req.header(name, value);
    }
    if !body.is_empty() {
        req = req.body(body);
    }

    match req.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let resp_headers: Vec<HeaderPair> = resp
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            LocalResponse { status, headers: resp_headers, body }
        }
        Err(e) => LocalResponse {
            status: 502,
            headers: vec![],
            body: format!("Local server error: {}", local_error_kind(&e)).into_bytes(),
        },
    }
}

/// A short, stable description of a `reqwest::Error` for the plain-text
/// 502 body `spec.md` §4.6 mandates (`"Local server error: <kind>"`).
fn local_error_kind(e: &reqwest::Error) -> String {
    if e.is_connect() {
        "connection refused".to_string()
    } else if e.is_timeout() {
        "timed out".to_string()
    } else if e.is_redirect() {
        "unexpected redirect".to_string()
    } else {
        e.to_string()
    }
}

fn server_host(server_url: &str) -> String {
    server_url
        .trim_start_matches("ws://")
        .trim_start_matches("wss://")
        .split(['/', ':'])
        .next()
        .unwrap_or("localhost")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_thirty_seconds() {
        // Jitter is +/-25%, so check bounds rather than exact values.
        let d0 = next_backoff(0);
        assert!(d0 >= Duration::from_millis(375) && d0 <= Duration::from_millis(625));

        let d_big = next_backoff(20);
        assert!(d_big <= Duration::from_secs(38)); // 30s * 1.25 headroom
        assert!(d_big >= Duration::from_secs(22));
    }

    #[test]
    fn server_host_strips_scheme_port_and_path() {
        assert_eq!(server_host("ws://tunnel.example.com:8765/ws"), "tunnel.example.com");
        assert_eq!(server_host("wss://example.com/ws"), "example.com");
    }

    /// S6: nothing is listening on the configured local port. The forwarder
    /// must report a 502 with the `"Local server error: "` body prefix and
    /// never panic.
    #[tokio::test]
    async fn local_connection_refused_reports_502() {
        // Bind and immediately drop a listener to get a port that is free
        // at call time but was at least briefly valid, avoiding flakiness
        // from picking an arbitrary hardcoded port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let response = forward_to_local(
            &format!("http://127.0.0.1:{port}"),
            "GET",
            "/",
            vec![],
            "",
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(response.status, 502);
        assert!(String::from_utf8_lossy(&response.body).starts_with("Local server error: "));
    }

    /// A healthy local service: the forwarder relays method/path/body and
    /// hop-by-hop headers are stripped before the request ever leaves.
    #[tokio::test]
    async fn forwards_request_and_relays_local_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let request_text = String::from_utf8_lossy(&buf[..n]).to_string();
            let body = b"echoed";
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.write_all(body).await.unwrap();
            request_text
        });

        let response = forward_to_local(
            &format!("http://127.0.0.1:{port}"),
            "POST",
            "/echo",
            vec![
                ("X-Test".to_string(), "1".to_string()),
                ("Connection".to_string(), "keep-alive".to_string()),
            ],
            &encode_body(b"payload"),
            Duration::from_secs(1),
        )
        .await;

        let request_text = server.await.unwrap();
        assert!(request_text.starts_with("POST /echo"));
        assert!(request_text.contains("x-test: 1") || request_text.contains("X-Test: 1"));
        assert!(!request_text.to_lowercase().contains("connection: keep-alive"));

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"echoed");
    }
}

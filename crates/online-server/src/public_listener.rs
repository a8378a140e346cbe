//! Per-session public HTTP listener.
//!
//! Every registered session owns one bound [`TcpListener`] on its allocated
//! public port (`spec.md` §4.2/§4.3). This module runs that listener's
//! accept loop: parse each inbound HTTP/1.1 request with `httparse`, turn it
//! into a `Request` envelope correlated by a fresh `request_id`, push it
//! down the control channel, and write back whatever `Response` (or
//! timeout/error) comes back.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use online_core::messages::{Envelope, HeaderPair};
use online_core::{encode_body, strip_hop_by_hop};

use crate::correlation::WaiterOutcome;
use crate::session::Session;

/// Maximum request line + headers `httparse` will scan before giving up.
const MAX_HEADERS: usize = 64;
/// Default maximum request body size accepted from a public client
/// (`spec.md` §4.5, `MAX_REQUEST_BODY_BYTES`, default 16 MiB).
pub const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;
/// Maximum bytes read while still assembling the head (line + headers).
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Drive one session's public listener until its cancel signal fires or the
/// socket errors out. Spawned once per session by `server.rs`.
pub async fn run_accept_loop(
    session: Arc<Session>,
    mut cancel_rx: mpsc::Receiver<()>,
    request_timeout: Duration,
    max_body_bytes: usize,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(client_id = %session.client_id, "public listener accept loop cancelled");
                return;
            }
            accepted = session.public_listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let session = session.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(&session, stream, request_timeout, max_body_bytes).await {
                                debug!(client_id = %session.client_id, peer = %peer, error = %e, "public connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(client_id = %session.client_id, error = %e, "public listener accept failed");
                        return;
                    }
                }
            }
        }
    }
}

/// Why parsing the public request failed — distinguishes the `413` the spec
/// mandates for an over-limit body from the generic `400` for anything else.
enum ReadError {
    TooLarge(usize, usize),
    Malformed(String),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::TooLarge(got, max) => write!(f, "request body too large: {got} bytes (max {max})"),
            ReadError::Malformed(msg) => write!(f, "{msg}"),
        }
    }
}

async fn handle_connection(
    session: &Arc<Session>,
    mut stream: TcpStream,
    request_timeout: Duration,
    max_body_bytes: usize,
) -> std::io::Result<()> {
    let parsed = match read_request(&mut stream, max_body_bytes).await {
        Ok(Some(req)) => req,
        Ok(None) => return Ok(()), // peer closed before sending anything
        Err(ReadError::TooLarge(got, max)) => {
            let body = format!("request body too large: {got} bytes (max {max})");
            write_plain_response(&mut stream, 413, "Payload Too Large", body.as_bytes()).await?;
            return Ok(());
        }
        Err(e @ ReadError::Malformed(_)) => {
            write_plain_response(&mut stream, 400, "Bad Request", e.to_string().as_bytes()).await?;
            return Ok(());
        }
    };

    session.touch();
    let request_id = Uuid::new_v4().to_string();
    let headers = strip_hop_by_hop(parsed.headers);
    let envelope = Envelope::Request {
        request_id: request_id.clone(),
        method: parsed.method,
        path: parsed.path,
        headers,
        body_b64: encode_body(&parsed.body),
    };

    let rx = session.pending.insert(request_id.clone(), request_timeout);
    if session.outbound_tx.send(envelope).await.is_err() {
        session.pending.remove(&request_id);
        write_plain_response(&mut stream, 502, "Bad Gateway", b"tunnel control channel closed").await?;
        return Ok(());
    }

    match rx.await {
        Ok(WaiterOutcome::Response { status, headers, body }) => {
            write_response(&mut stream, status, headers, &body).await?;
        }
        Ok(WaiterOutcome::Timeout) => {
            write_plain_response(&mut stream, 504, "Gateway Timeout", b"upstream did not respond in time").await?;
        }
        Ok(WaiterOutcome::SessionClosed) => {
            write_plain_response(&mut stream, 502, "Bad Gateway", b"tunnel session closed").await?;
        }
        Ok(WaiterOutcome::Protocol(msg)) => {
            write_plain_response(&mut stream, 502, "Bad Gateway", msg.as_bytes()).await?;
        }
        Err(_) => {
            // Waiter dropped without a send — treat like session closure.
            write_plain_response(&mut stream, 502, "Bad Gateway", b"tunnel session closed").await?;
        }
    }

    Ok(())
}

struct ParsedRequest {
    method: String,
    path: String,
    headers: Vec<HeaderPair>,
    body: Vec<u8>,
}

/// Read and parse one HTTP/1.1 request off `stream`: request line, headers,
/// and (if `Content-Length` is present) exactly that many body bytes.
/// Chunked transfer-encoding is not supported — see `spec.md` Non-goals.
async fn read_request(stream: &mut TcpStream, max_body_bytes: usize) -> Result<Option<ParsedRequest>, ReadError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let head_end;

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ReadError::Malformed(format!("read error: {e}")))?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ReadError::Malformed("connection closed before headers complete".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ReadError::Malformed("request head too large".to_string()));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(n)) => {
                head_end = n;
                break;
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => return Err(ReadError::Malformed(format!("malformed request: {e}"))),
        }
    }

    let mut headers_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers_buf);
    let _ = req
        .parse(&buf[..head_end])
        .map_err(|e| ReadError::Malformed(format!("malformed request: {e}")))?;

    let method = req.method.unwrap_or("GET").to_string();
    let path = req.path.unwrap_or("/").to_string();
    let headers: Vec<HeaderPair> = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    if content_length > max_body_bytes {
        return Err(ReadError::TooLarge(content_length, max_body_bytes));
    }

    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ReadError::Malformed(format!("read error: {e}")))?;
        if n == 0 {
            return Err(ReadError::Malformed("connection closed before body complete".to_string()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(ParsedRequest { method, path, headers, body }))
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    headers: Vec<HeaderPair>,
    body: &[u8],
) -> std::io::Result<()> {
    let reason = reason_phrase(status);
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n").into_bytes();
    let headers = strip_hop_by_hop(headers);
    let has_content_length = headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-length"));
    for (name, value) in &headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !has_content_length {
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"connection: close\r\n\r\n");
    out.extend_from_slice(body);
    stream.write_all(&out).await?;
    stream.flush().await
}

async fn write_plain_response(stream: &mut TcpStream, status: u16, reason: &str, body: &[u8]) -> std::io::Result<()> {
    let mut out = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    stream.write_all(&out).await?;
    stream.flush().await
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

//! Request correlation table.
//!
//! Maps a server-generated `request_id` to the waiting public HTTP
//! connection task. Modelled as a `oneshot` per waiter — the
//! "single-fire completion hand-off" `spec.md` §3 describes — keyed by
//! `request_id` in a map guarded by the session's own lock, following the
//! reactor-style pending-request table pattern used for exactly this kind
//! of request/response correlation in comparable relay clients (e.g. a
//! ZeroMQ Lazy-Pirate dealer's `PendingRequest { response_tx, deadline }`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use online_core::messages::HeaderPair;

/// The terminal outcome handed to a waiting public connection.
#[derive(Debug)]
pub enum WaiterOutcome {
    /// The client's `Response` envelope arrived in time.
    Response {
        status: u16,
        headers: Vec<HeaderPair>,
        body: Vec<u8>,
    },
    /// The deadline elapsed before a response arrived.
    Timeout,
    /// The session closed (control channel lost, admin close, shutdown)
    /// while this request was still pending.
    SessionClosed,
    /// The client's `Response` body failed to base64-decode.
    Protocol(String),
}

struct Waiter {
    sender: oneshot::Sender<WaiterOutcome>,
    deadline: Instant,
}

/// Per-session `request_id -> waiter` index.
///
/// Every method takes `&self` and locks internally — callers never hold the
/// lock across an `.await`, so a slow public connection can't stall
/// unrelated requests on the same session.
pub struct CorrelationTable {
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Register a waiter for `request_id` with the given timeout, returning
    /// the receiver half the caller awaits. Panics (a programmer error, not
    /// a runtime condition) if `request_id` is already registered — under
    /// UUIDv4 generation this must not happen, per `spec.md` §4.4.
    pub fn insert(&self, request_id: String, timeout: Duration) -> oneshot::Receiver<WaiterOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap();
        let prev = waiters.insert(
            request_id,
            Waiter {
                sender: tx,
                deadline: Instant::now() + timeout,
            },
        );
        assert!(prev.is_none(), "duplicate request_id inserted into correlation table");
        rx
    }

    /// Complete a waiter with the client's response. A no-op (response
    /// discarded) if the id is absent — it already timed out, was aborted,
    /// or the session closed.
    pub fn complete(&self, request_id: &str, status: u16, headers: Vec<HeaderPair>, body: Vec<u8>) {
        if let Some(waiter) = self.waiters.lock().unwrap().remove(request_id) {
            let _ = waiter.sender.send(WaiterOutcome::Response { status, headers, body });
        }
    }

    /// Fail a waiter because its base64 body failed to decode. Same
    /// removal semantics as `complete`.
    pub fn fail_protocol(&self, request_id: &str, message: String) {
        if let Some(waiter) = self.waiters.lock().unwrap().remove(request_id) {
            let _ = waiter.sender.send(WaiterOutcome::Protocol(message));
        }
    }

    /// Remove a single waiter without firing an outcome — used when the
    /// public connection aborts mid-wait and no one is listening any more.
    pub fn remove(&self, request_id: &str) {
        self.waiters.lock().unwrap().remove(request_id);
    }

    /// Fail and remove every waiter past its deadline. Returns how many
    /// were reaped, for logging.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut waiters = self.waiters.lock().unwrap();
        let expired: Vec<String> = waiters
            .iter()
            .filter(|(_, w)| w.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(waiter) = waiters.remove(id) {
                let _ = waiter.sender.send(WaiterOutcome::Timeout);
            }
        }
        expired.len()
    }

    /// Remove and fail every waiter — called once when a session closes.
    pub fn fail_all(&self) {
        let mut waiters = self.waiters.lock().unwrap();
        for (_, waiter) in waiters.drain() {
            let _ = waiter.sender.send(WaiterOutcome::SessionClosed);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_delivers_response_to_waiter() {
        let table = CorrelationTable::new();
        let rx = table.insert("r1".into(), Duration::from_secs(30));
        table.complete("r1", 200, vec![], b"hello".to_vec());
        match rx.await.unwrap() {
            WaiterOutcome::Response { status, body, .. } => {
                assert_eq!(status, 200);
                assert_eq!(body, b"hello");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn late_response_after_removal_is_discarded() {
        let table = CorrelationTable::new();
        let rx = table.insert("r1".into(), Duration::from_secs(30));
        table.remove("r1");
        table.complete("r1", 200, vec![], vec![]);
        // The receiver observes the sender dropped, not a response.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn reap_expired_times_out_past_deadline_waiters_only() {
        let table = CorrelationTable::new();
        let rx_expired = table.insert("expired".into(), Duration::from_millis(0));
        let rx_fresh = table.insert("fresh".into(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reaped = table.reap_expired();
        assert_eq!(reaped, 1);
        assert!(matches!(rx_expired.await.unwrap(), WaiterOutcome::Timeout));
        assert_eq!(table.len(), 1);
        drop(rx_fresh);
    }

    #[tokio::test]
    async fn fail_all_completes_every_waiter_exactly_once() {
        let table = CorrelationTable::new();
        let rx1 = table.insert("a".into(), Duration::from_secs(30));
        let rx2 = table.insert("b".into(), Duration::from_secs(30));
        table.fail_all();
        assert!(table.is_empty());
        assert!(matches!(rx1.await.unwrap(), WaiterOutcome::SessionClosed));
        assert!(matches!(rx2.await.unwrap(), WaiterOutcome::SessionClosed));

        // Idempotent: calling again touches nothing, no panic / double-send.
        table.fail_all();
    }
}

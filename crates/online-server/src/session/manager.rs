//! Session lifecycle management.
//!
//! Owns the `client_id -> Session` table, the shared port allocator, and
//! the state machine each session moves through from registration to
//! teardown. This is the process-wide singleton `spec.md` §9 calls for:
//! created once at server boot, torn down at shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use online_core::messages::Envelope;
use online_core::error::OnlineError;

use crate::correlation::CorrelationTable;
use crate::port_allocator::{PortAllocator, PortRange};

/// Lifecycle state of a [`Session`], per `spec.md` §4.3's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Registering = 0,
    Active = 1,
    Draining = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Registering,
            1 => SessionState::Active,
            2 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }
}

/// Server-side state for one connected client.
pub struct Session {
    pub client_id: String,
    pub public_port: u16,
    /// The bound public listener. Holding it here (rather than letting the
    /// accept-loop task own it outright) means dropping the last `Arc`
    /// closes the socket — the invariant that destroying a session closes
    /// its listener on every exit path, including a panic in the accept
    /// loop.
    pub public_listener: Arc<TcpListener>,
    /// Sender half of this session's outbound control-channel queue. All
    /// writers funnel frames through here; exactly one task owns the other
    /// end and performs the actual WebSocket send, giving single-writer
    /// discipline per `spec.md` §5. Bounded at 256 per the spec's
    /// backpressure policy.
    pub outbound_tx: mpsc::Sender<Envelope>,
    /// Per-session request correlation table.
    pub pending: CorrelationTable,
    /// Signals the public listener's accept loop to stop.
    listener_cancel: mpsc::Sender<()>,
    pub created_at: Instant,
    last_activity_at: Mutex<Instant>,
    state: AtomicU8,
    /// Guards against `close()` performing its teardown more than once;
    /// `compare_exchange` makes "exactly one invocation transitions state"
    /// hold even when two paths (control EOF and admin close) race.
    closing: std::sync::atomic::AtomicBool,
}

impl Session {
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, s: SessionState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    pub fn touch(&self) {
        *self.last_activity_at.lock().unwrap() = Instant::now();
    }

    pub fn last_activity_at(&self) -> Instant {
        *self.last_activity_at.lock().unwrap()
    }

    /// Request that the public listener's accept loop stop. Best-effort —
    /// if the loop already ended, the send is simply dropped.
    fn cancel_listener(&self) {
        let _ = self.listener_cancel.try_send(());
    }
}

/// Snapshot used by `SessionManager::list`.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub client_id: String,
    pub public_port: u16,
    pub state: SessionState,
    pub pending_count: usize,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// Owns every live session plus the shared port allocator.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    ports: Mutex<PortAllocator>,
    max_clients: usize,
    bind_host: String,
}

impl SessionManager {
    pub fn new(port_range: PortRange, max_clients: usize, bind_host: impl Into<String>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ports: Mutex::new(PortAllocator::new(port_range)),
            max_clients,
            bind_host: bind_host.into(),
        }
    }

    /// Register a new client: allocate a port, bind the public listener,
    /// and insert the session in `Registering` state.
    ///
    /// Returns the new session plus the receiver half of its listener-cancel
    /// channel — the caller (`server.rs`) owns spawning the accept-loop task
    /// and must select on that receiver to know when to stop.
    ///
    /// Fails with `NoPortAvailable` if the range is exhausted, `BindFailed` if
    /// the OS refuses the bind (e.g. the port is already in use despite
    /// being free in our own bookkeeping), or `Other` if `max_clients` is
    /// already reached or `client_id` is a duplicate.
    pub async fn register(
        &self,
        client_id: String,
        outbound_tx: mpsc::Sender<Envelope>,
    ) -> Result<(Arc<Session>, mpsc::Receiver<()>), OnlineError> {
        {
            let sessions = self.sessions.read().await;
            if sessions.len() >= self.max_clients {
                return Err(OnlineError::Other(format!(
                    "max_clients ({}) reached",
                    self.max_clients
                )));
            }
            if sessions.contains_key(&client_id) {
                return Err(OnlineError::Other(format!("duplicate client_id {client_id}")));
            }
        }

        let port = {
            let mut ports = self.ports.lock().unwrap();
            ports.allocate().map_err(|_| OnlineError::NoPortAvailable)?
        };

        let addr: SocketAddr = format!("{}:{}", self.bind_host, port)
            .parse()
            .map_err(|e| OnlineError::BindFailed(format!("invalid bind address: {e}")))?;

        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                // Roll back the allocation — the port never actually became live.
                self.ports.lock().unwrap().release(port);
                return Err(OnlineError::BindFailed(e.to_string()));
            }
        };

        let now = Instant::now();
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let session = Arc::new(Session {
            client_id: client_id.clone(),
            public_port: port,
            public_listener: Arc::new(listener),
            outbound_tx,
            pending: CorrelationTable::new(),
            listener_cancel: cancel_tx,
            created_at: now,
            last_activity_at: Mutex::new(now),
            state: AtomicU8::new(SessionState::Registering as u8),
            closing: std::sync::atomic::AtomicBool::new(false),
        });

        self.sessions.write().await.insert(client_id.clone(), session.clone());
        info!(client_id = %client_id, public_port = port, "session registered");

        Ok((session, cancel_rx))
    }

    pub async fn mark_active(&self, client_id: &str) {
        if let Some(s) = self.sessions.read().await.get(client_id) {
            s.set_state(SessionState::Active);
            info!(client_id, "session active");
        }
    }

    pub async fn lookup(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(client_id).cloned()
    }

    /// Close a session: `Active -> Draining -> Closed`. Safe to call
    /// concurrently — only the first caller performs the teardown; later
    /// calls are no-ops, satisfying idempotence (`spec.md` §8 invariant 6).
    pub async fn close(&self, client_id: &str, reason: &str) {
        let session = { self.sessions.read().await.get(client_id).cloned() };
        let Some(session) = session else { return };

        if session
            .closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return; // another caller already owns teardown
        }

        session.set_state(SessionState::Draining);
        session.cancel_listener();
        session.pending.fail_all();
        session.set_state(SessionState::Closed);

        self.sessions.write().await.remove(client_id);
        self.ports.lock().unwrap().release(session.public_port);

        debug_assert!(session.pending.is_empty());
        info!(client_id, reason, "session closed");
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let now = Instant::now();
        sessions
            .values()
            .map(|s| SessionInfo {
                client_id: s.client_id.clone(),
                public_port: s.public_port,
                state: s.state(),
                pending_count: s.pending.len(),
                age_secs: now.duration_since(s.created_at).as_secs(),
                idle_secs: now.duration_since(s.last_activity_at()).as_secs(),
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn in_use_port_count(&self) -> usize {
        self.ports.lock().unwrap().in_use_count()
    }

    /// Periodic maintenance: reap expired waiters across all sessions.
    /// Mirrors the teacher's `gc()` task cadence (`server.rs`'s 60s
    /// interval), but per-request timeout reaping runs far more often —
    /// see `online-server`'s main loop, which calls this every second.
    pub async fn reap_expired_waiters(&self) -> usize {
        let sessions = self.sessions.read().await;
        let mut total = 0;
        for session in sessions.values() {
            let n = session.pending.reap_expired();
            if n > 0 {
                debug!(client_id = %session.client_id, reaped = n, "reaped timed-out waiters");
            }
            total += n;
        }
        total
    }

    /// Signal every session to start draining and wait up to `grace` for
    /// in-flight requests to finish before forcing closed. Used at server
    /// shutdown (`spec.md` §5).
    pub async fn shutdown(&self, grace: Duration) {
        let client_ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in &client_ids {
            if let Some(s) = self.sessions.read().await.get(id) {
                s.set_state(SessionState::Draining);
            }
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            let any_pending = {
                let sessions = self.sessions.read().await;
                sessions.values().any(|s| !s.pending.is_empty())
            };
            if !any_pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for id in &client_ids {
            self.close(id, "server shutdown").await;
        }
    }
}

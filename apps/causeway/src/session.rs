use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use negotiation_webrtc::Negotiation;
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::ServerFrame;

/// Commands for a session's writer task, which owns the socket sink.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerFrame),
    Ping,
    Close,
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnect,
    TransportError,
    LivenessTimeout,
    NegotiationFailed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CloseReason::ClientDisconnect => "client disconnect",
            CloseReason::TransportError => "transport error",
            CloseReason::LivenessTimeout => "liveness timeout",
            CloseReason::NegotiationFailed => "negotiation failed",
        };
        f.write_str(label)
    }
}

/// One connected client. Every task that touches the session shares it
/// through an Arc; the socket sink itself is reachable only through the
/// outbound queue.
pub struct Session {
    pub id: Uuid,
    outbound: mpsc::UnboundedSender<Outbound>,
    last_activity: RwLock<Instant>,
    negotiation: Mutex<Option<Arc<dyn Negotiation>>>,
    pub(crate) shutdown: Notify,
}

impl Session {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            last_activity: RwLock::new(Instant::now()),
            negotiation: Mutex::new(None),
            shutdown: Notify::new(),
        }
    }

    /// Queue a message for the writer task. Returns false once the writer
    /// has exited and the transport is effectively gone.
    pub fn enqueue(&self, message: Outbound) -> bool {
        self.outbound.send(message).is_ok()
    }

    pub async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }

    /// Lock the negotiation slot. Held across handle creation so a session
    /// never ends up with two live negotiations.
    pub async fn negotiation_slot(&self) -> MutexGuard<'_, Option<Arc<dyn Negotiation>>> {
        self.negotiation.lock().await
    }

    pub async fn current_negotiation(&self) -> Option<Arc<dyn Negotiation>> {
        self.negotiation.lock().await.clone()
    }

    pub async fn take_negotiation(&self) -> Option<Arc<dyn Negotiation>> {
        self.negotiation.lock().await.take()
    }
}

/// Process-wide set of live sessions. A session appears here exactly as
/// long as its transport is considered open.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) {
        self.sessions.insert(session.id, session);
    }

    /// Remove a session. Only the caller that actually removed the entry
    /// gets true, which collapses concurrent teardown triggers to one
    /// winner.
    pub fn unregister(&self, id: Uuid) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Tear a session down: release its negotiation, tell the writer to close
/// the transport, and wake every task parked on the session. Safe to call
/// from any number of triggers at once.
pub async fn teardown(
    registry: &SessionRegistry,
    session: &Arc<Session>,
    reason: CloseReason,
) -> bool {
    if !registry.unregister(session.id) {
        return false;
    }

    info!(
        session_id = %session.id,
        reason = %reason,
        active = registry.len(),
        "session closed"
    );

    if let Some(handle) = session.take_negotiation().await {
        if let Err(err) = handle.close().await {
            warn!(session_id = %session.id, error = %err, "negotiation close failed");
        }
    }

    session.enqueue(Outbound::Close);
    session.shutdown.notify_waiters();
    true
}

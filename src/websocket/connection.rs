use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::WebSocketError;

pub type ConnectionId = Uuid;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// One client link as seen by the registry and the router.
///
/// The outbound side is a bounded queue drained by the connection's own
/// writer task, so enqueueing never waits on the client's socket.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    label: Option<String>,
    connected_at: DateTime<Utc>,
    state: watch::Sender<ConnectionState>,
    tx: mpsc::Sender<Message>,
    dropped: AtomicU64,
}

impl Connection {
    pub fn new(
        peer_addr: SocketAddr,
        label: Option<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Open);

        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            peer_addr,
            label,
            connected_at: Utc::now(),
            state,
            tx,
            dropped: AtomicU64::new(0),
        });

        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Client-supplied `type` query parameter, if any. Used for logging only.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queue a frame for this client without waiting.
    pub fn try_send(&self, msg: Message) -> Result<(), WebSocketError> {
        if !self.is_open() {
            return Err(WebSocketError::ConnectionClosed);
        }

        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WebSocketError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => WebSocketError::ConnectionClosed,
        })
    }

    pub fn record_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Frames discarded because the outbound queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// `Open -> Closing`. Returns true only for the call that made the transition.
    pub fn begin_close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        })
    }

    /// `-> Closed`. Returns true only for the call that made the transition,
    /// so the caller holding `true` owns releasing the connection's resources.
    pub fn mark_closed(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        })
    }

    /// Resolves once the connection has left `Open`.
    pub async fn closing(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this only errors if it was dropped mid-wait.
        let _ = rx.wait_for(|state| *state != ConnectionState::Open).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

#[cfg(test)]
pub(crate) fn test_addr() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

//! Connections and the peer handles events are delivered through.
//!
//! A [`PeerHandle`] is the sending half of a bounded per-connection queue. The
//! transport drains the receiving half and writes frames to the socket, so a
//! slow socket only ever fills its own queue.

use crate::event::{BoardId, DrawEvent};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{}", crate::event::now_millis(), n))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Why an event could not be handed to a peer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The peer's outbound queue is full; the event is dropped for that peer.
    #[error("Peer queue full")]
    QueueFull,

    /// The transport side of the queue is gone.
    #[error("Peer closed")]
    Closed,

    /// The peer did not accept a replayed event in time.
    #[error("Delivery timed out")]
    Timeout,
}

/// Receiving half of a peer queue, owned by the transport.
pub type PeerReceiver = mpsc::Receiver<Arc<DrawEvent>>;

/// Sending half of a peer queue.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<Arc<DrawEvent>>,
}

impl PeerHandle {
    /// Create a peer queue holding at most `capacity` undelivered events.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, PeerReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue a live event without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::QueueFull`] for a slow peer and
    /// [`DeliveryError::Closed`] once the transport has gone away.
    pub fn deliver(&self, event: Arc<DrawEvent>) -> Result<(), DeliveryError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Enqueue a replayed event, waiting at most `timeout` for queue space.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Timeout`] or [`DeliveryError::Closed`].
    pub async fn deliver_within(
        &self,
        event: Arc<DrawEvent>,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        match tokio::time::timeout(timeout, self.tx.send(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::Timeout),
        }
    }

    /// Check whether the transport has dropped its receiver.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Authorizing and replaying history.
    Connecting = 0,
    /// Registered for live delivery.
    Joined = 1,
    /// Terminal.
    Disconnected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Joined,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// One client session on one board.
///
/// Clones share the same state, so the copy held by the registry observes a
/// disconnect immediately.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    board_id: BoardId,
    identity: Option<String>,
    peer: PeerHandle,
    state: Arc<AtomicU8>,
}

impl Connection {
    /// Create a connection in the `Connecting` state.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        board_id: impl Into<BoardId>,
        identity: Option<String>,
        peer: PeerHandle,
    ) -> Self {
        Self {
            id,
            board_id: board_id.into(),
            identity,
            peer,
            state: Arc::new(AtomicU8::new(ConnectionState::Connecting as u8)),
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    /// Identity presented to the authorization gate, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    #[must_use]
    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether `other` is a clone of this connection rather than a separate
    /// session that happens to share its id.
    #[must_use]
    pub fn is_same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Move `Connecting -> Joined`. Returns `false` from any other state.
    pub(crate) fn mark_joined(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Joined as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Disconnected`. Returns the previous state.
    pub(crate) fn mark_disconnected(&self) -> ConnectionState {
        ConnectionState::from_u8(
            self.state
                .swap(ConnectionState::Disconnected as u8, Ordering::AcqRel),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribble_protocol::Point;

    fn event() -> Arc<DrawEvent> {
        Arc::new(DrawEvent::new("b", Point::default(), Point::new(1.0, 1.0)))
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_deliver_reports_full_and_closed() {
        let (peer, rx) = PeerHandle::channel(1);

        assert!(peer.deliver(event()).is_ok());
        assert_eq!(peer.deliver(event()), Err(DeliveryError::QueueFull));

        drop(rx);
        assert!(peer.is_closed());
        assert_eq!(peer.deliver(event()), Err(DeliveryError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_within_times_out() {
        let (peer, _rx) = PeerHandle::channel(1);
        peer.deliver(event()).unwrap();

        let result = peer
            .deliver_within(event(), Duration::from_millis(50))
            .await;
        assert_eq!(result, Err(DeliveryError::Timeout));
    }

    #[test]
    fn test_state_transitions_are_one_way() {
        let (peer, _rx) = PeerHandle::channel(4);
        let conn = Connection::new(ConnectionId::from("c1"), "b", None, peer);
        let shared = conn.clone();

        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.mark_joined());
        assert_eq!(shared.state(), ConnectionState::Joined);
        assert!(shared.is_same(&conn));

        assert_eq!(conn.mark_disconnected(), ConnectionState::Joined);
        assert!(!conn.mark_joined());
        assert_eq!(shared.state(), ConnectionState::Disconnected);
    }
}

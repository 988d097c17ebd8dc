//! Connection lifecycle: `Connecting -> Joined -> Disconnected`.
//!
//! The [`ConnectionManager`] is the one owner of registry membership. A join
//! authorizes, replays history, and only then registers the connection for
//! live delivery. A disconnected connection never comes back; reconnecting
//! means a new connection and a fresh replay.

use crate::auth::Authorizer;
use crate::broadcaster::{Broadcaster, PublishReport};
use crate::event::{validate_board_id, DrawEvent};
use crate::peer::{Connection, ConnectionId, ConnectionState, PeerHandle};
use crate::registry::{RegistryConfig, RegistryError, RegistryStats, SessionRegistry};
use crate::replay::{ReplayConfig, ReplayCoordinator, ReplayError};
use crate::store::{EventStore, StoreError};
use scribble_protocol::{Point, StrokeStyle};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a join did not complete.
#[derive(Debug, Error)]
pub enum JoinError {
    /// Malformed board identifier.
    #[error("Invalid board id: {0}")]
    InvalidBoard(&'static str),

    /// The authorization gate said no.
    #[error("Not authorized for board: {0}")]
    Unauthorized(String),

    /// History replay failed.
    #[error(transparent)]
    Replay(#[from] ReplayError),

    /// Registry limits.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Why a draw event was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    /// Only joined connections may draw.
    #[error("Connection {0} is not joined")]
    NotJoined(ConnectionId),
}

/// Why a history read was refused.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The authorization gate said no.
    #[error("Not authorized for board: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration for the engine.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub registry: RegistryConfig,
    pub replay: ReplayConfig,
}

/// A connection that finished joining.
#[derive(Debug)]
pub struct Joined {
    pub connection: Connection,
    /// Events delivered by replay.
    pub replayed: u64,
}

/// Owns the registry, broadcaster and replay coordinator for one process.
pub struct ConnectionManager {
    registry: Arc<SessionRegistry>,
    broadcaster: Broadcaster,
    replay: ReplayCoordinator,
    store: Arc<dyn EventStore>,
    authorizer: Arc<dyn Authorizer>,
}

impl ConnectionManager {
    /// Build the engine over an event log and an authorization gate.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        authorizer: Arc<dyn Authorizer>,
        config: ManagerConfig,
    ) -> Self {
        info!(store = store.name(), "Starting connection manager");
        let registry = Arc::new(SessionRegistry::with_config(config.registry));
        Self {
            broadcaster: Broadcaster::new(Arc::clone(&registry), Arc::clone(&store)),
            replay: ReplayCoordinator::new(Arc::clone(&store), config.replay),
            registry,
            store,
            authorizer,
        }
    }

    /// The live session table.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Authorize, replay history, then register a connection on `board`.
    ///
    /// # Errors
    ///
    /// Authorization failures happen before any side effect. Replay and
    /// registry failures leave the connection unregistered and disconnected.
    pub async fn connect(
        &self,
        id: ConnectionId,
        board: &str,
        identity: Option<String>,
        peer: PeerHandle,
    ) -> Result<Joined, JoinError> {
        validate_board_id(board).map_err(JoinError::InvalidBoard)?;

        if !self.authorizer.is_authorized(identity.as_deref(), board).await {
            warn!(board = %board, connection = %id, "Join denied");
            return Err(JoinError::Unauthorized(board.to_string()));
        }

        let connection = Connection::new(id, board, identity, peer);

        let replayed = match self.replay.replay(&connection).await {
            Ok(n) => n,
            Err(e) => {
                warn!(board = %board, connection = %connection.id(), error = %e, "Replay failed");
                self.abort(&connection);
                return Err(e.into());
            }
        };

        connection.mark_joined();
        if let Err(e) = self.registry.join(board, connection.clone()) {
            warn!(board = %board, connection = %connection.id(), error = %e, "Registration refused");
            self.abort(&connection);
            return Err(e.into());
        }

        info!(board = %board, connection = %connection.id(), replayed, "Connection joined");
        Ok(Joined {
            connection,
            replayed,
        })
    }

    fn abort(&self, connection: &Connection) {
        connection.mark_disconnected();
        self.registry.leave(connection.board_id(), connection);
    }

    /// Publish a stroke segment drawn by `connection`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not joined. Delivery and log
    /// failures are reported in the [`PublishReport`] instead.
    pub async fn publish(
        &self,
        connection: &Connection,
        from: Point,
        to: Point,
        style: Option<StrokeStyle>,
    ) -> Result<PublishReport, PublishError> {
        if connection.state() != ConnectionState::Joined {
            return Err(PublishError::NotJoined(connection.id().clone()));
        }

        let event = DrawEvent::new(connection.board_id(), from, to).with_style(style);
        Ok(self.broadcaster.publish(connection.id(), event).await)
    }

    /// Move a connection to `Disconnected` and stop delivering to it.
    ///
    /// Returns `false` if it was already disconnected.
    pub fn disconnect(&self, connection: &Connection) -> bool {
        if connection.mark_disconnected() == ConnectionState::Disconnected {
            return false;
        }
        self.registry.leave(connection.board_id(), connection);
        self.broadcaster.release(connection.board_id());
        debug!(board = %connection.board_id(), connection = %connection.id(), "Connection disconnected");
        true
    }

    /// Read persisted history of a board on behalf of `identity`.
    ///
    /// The same gate as [`connect`](Self::connect) applies.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity may not access the board or the log
    /// cannot be read.
    pub async fn history(
        &self,
        identity: Option<&str>,
        board: &str,
        start: u64,
        limit: usize,
    ) -> Result<Vec<DrawEvent>, HistoryError> {
        if !self.authorizer.is_authorized(identity, board).await {
            warn!(board = %board, "History read denied");
            return Err(HistoryError::Unauthorized(board.to_string()));
        }
        Ok(self.store.read_from(board, start, limit).await?)
    }

    /// Disconnect everyone and flush the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let drained = self.registry.drain();
        for connection in &drained {
            connection.mark_disconnected();
        }
        info!(connections = drained.len(), "Connection manager shutting down");
        self.store.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, BoardAcl};
    use crate::peer::PeerReceiver;
    use crate::replay::ReplayConfig;
    use crate::store::MemoryEventStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn manager(store: Arc<MemoryEventStore>) -> ConnectionManager {
        ConnectionManager::new(store, Arc::new(AllowAll), ManagerConfig::default())
    }

    async fn join(m: &ConnectionManager, id: &str, board: &str) -> (Connection, PeerReceiver) {
        let (peer, rx) = PeerHandle::channel(64);
        let joined = m
            .connect(ConnectionId::from(id), board, None, peer)
            .await
            .unwrap();
        (joined.connection, rx)
    }

    #[tokio::test]
    async fn test_denied_join_has_no_side_effects() {
        let store = Arc::new(MemoryEventStore::new());
        let acl = BoardAcl::new(false).with_board("private", ["alice"]);
        let m = ConnectionManager::new(store, Arc::new(acl), ManagerConfig::default());

        let (peer, mut rx) = PeerHandle::channel(4);
        let result = m
            .connect(ConnectionId::from("c1"), "private", Some("eve".into()), peer)
            .await;

        assert!(matches!(result, Err(JoinError::Unauthorized(_))));
        assert_eq!(m.stats().connection_count, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_board_rejected() {
        let m = manager(Arc::new(MemoryEventStore::new()));
        let (peer, _rx) = PeerHandle::channel(4);

        assert!(matches!(
            m.connect(ConnectionId::from("c1"), "$admin", None, peer).await,
            Err(JoinError::InvalidBoard(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_replay_leaves_nothing_registered() {
        let store = Arc::new(MemoryEventStore::new());
        store
            .append("b1", &DrawEvent::new("b1", Point::default(), Point::default()))
            .await
            .unwrap();
        let m = manager(store);

        let (peer, rx) = PeerHandle::channel(4);
        drop(rx);
        let result = m.connect(ConnectionId::from("c1"), "b1", None, peer).await;

        assert!(matches!(result, Err(JoinError::Replay(_))));
        assert_eq!(m.registry().member_count("b1"), 0);
    }

    #[tokio::test]
    async fn test_publish_requires_joined() {
        let m = manager(Arc::new(MemoryEventStore::new()));
        let (conn, _rx) = join(&m, "c1", "b1").await;

        assert!(m.disconnect(&conn));
        assert!(!m.disconnect(&conn));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let result = m.publish(&conn, Point::default(), Point::default(), None).await;
        assert_eq!(
            result.unwrap_err(),
            PublishError::NotJoined(ConnectionId::from("c1"))
        );
    }

    #[tokio::test]
    async fn test_reconnect_gets_fresh_replay() {
        let store = Arc::new(MemoryEventStore::new());
        let m = manager(store);

        let (writer, _w) = join(&m, "writer", "b1").await;
        let (reader, _r) = join(&m, "reader", "b1").await;
        m.publish(&writer, Point::new(1.0, 1.0), Point::new(2.0, 2.0), None)
            .await
            .unwrap();
        m.disconnect(&reader);

        let (peer, mut rx) = PeerHandle::channel(8);
        let joined = m
            .connect(ConnectionId::from("reader-2"), "b1", None, peer)
            .await
            .unwrap();
        assert_eq!(joined.replayed, 1);
        assert_eq!(rx.try_recv().unwrap().from, Point::new(1.0, 1.0));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everyone() {
        let m = manager(Arc::new(MemoryEventStore::new()));
        let (c1, _r1) = join(&m, "c1", "b1").await;
        let (c2, _r2) = join(&m, "c2", "b2").await;

        m.shutdown().await.unwrap();

        assert_eq!(m.stats().board_count, 0);
        assert_eq!(c1.state(), ConnectionState::Disconnected);
        assert_eq!(c2.state(), ConnectionState::Disconnected);
    }

    /// Memory log that refuses reads at or past an offset.
    struct ShortReads {
        inner: MemoryEventStore,
        fail_from: AtomicU64,
    }

    #[async_trait]
    impl EventStore for ShortReads {
        async fn append(&self, board: &str, event: &DrawEvent) -> Result<(), StoreError> {
            self.inner.append(board, event).await
        }
        async fn read_from(
            &self,
            board: &str,
            start: u64,
            limit: usize,
        ) -> Result<Vec<DrawEvent>, StoreError> {
            if start >= self.fail_from.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("read refused".into()));
            }
            self.inner.read_from(board, start, limit).await
        }
        async fn len(&self, board: &str) -> Result<u64, StoreError> {
            self.inner.len(board).await
        }
        fn name(&self) -> &'static str {
            "short-reads"
        }
    }

    #[tokio::test]
    async fn test_read_failure_mid_replay_only_affects_joiner() {
        let store = Arc::new(ShortReads {
            inner: MemoryEventStore::new(),
            fail_from: AtomicU64::new(u64::MAX),
        });
        let config = ManagerConfig {
            replay: ReplayConfig {
                batch_size: 1,
                send_timeout: Duration::from_millis(100),
            },
            ..ManagerConfig::default()
        };
        let m = ConnectionManager::new(store.clone(), Arc::new(AllowAll), config);

        let (writer, _w) = join(&m, "writer", "b1").await;
        let (reader, mut reader_rx) = join(&m, "reader", "b1").await;
        for i in 0..3 {
            let p = Point::new(f64::from(i), 0.0);
            m.publish(&writer, p, p, None).await.unwrap();
        }
        while reader_rx.try_recv().is_ok() {}

        store.fail_from.store(1, Ordering::SeqCst);
        let (peer, mut late_rx) = PeerHandle::channel(8);
        let result = m.connect(ConnectionId::from("late"), "b1", None, peer).await;

        assert!(matches!(
            result,
            Err(JoinError::Replay(ReplayError::Store(StoreError::Unavailable(_))))
        ));
        assert!(!m.registry().contains("b1", &ConnectionId::from("late")));
        assert_eq!(m.registry().member_count("b1"), 2);
        // Only the first page made it out before the failure.
        assert_eq!(late_rx.try_recv().unwrap().sequence, 0);
        assert!(late_rx.try_recv().is_err());

        let p = Point::new(9.0, 9.0);
        let report = m.publish(&writer, p, p, None).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(reader_rx.try_recv().unwrap().from, p);
        assert_eq!(reader.state(), ConnectionState::Joined);
    }

    #[tokio::test]
    async fn test_history_honours_acl() {
        let store = Arc::new(MemoryEventStore::new());
        store
            .append("private", &DrawEvent::new("private", Point::default(), Point::default()))
            .await
            .unwrap();
        let acl = BoardAcl::new(true).with_board("private", ["alice"]);
        let m = ConnectionManager::new(store, Arc::new(acl), ManagerConfig::default());

        assert_eq!(m.history(Some("alice"), "private", 0, 10).await.unwrap().len(), 1);
        assert!(matches!(
            m.history(Some("eve"), "private", 0, 10).await,
            Err(HistoryError::Unauthorized(_))
        ));
        assert!(matches!(
            m.history(None, "private", 0, 10).await,
            Err(HistoryError::Unauthorized(_))
        ));
        assert!(m.history(None, "lobby", 0, 10).await.unwrap().is_empty());
    }
}

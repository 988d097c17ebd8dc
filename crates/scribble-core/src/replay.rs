//! History replay for connections joining a board.
//!
//! A replay is bounded by the log length observed when it begins. Events
//! appended after that point belong to the live stream; the joining
//! connection is registered only after the whole replay has been delivered,
//! so nothing arrives twice. An event published between the boundary read and
//! registration is not seen by that connection.

use crate::event::{BoardId, DrawEvent};
use crate::peer::{Connection, DeliveryError};
use crate::store::{EventStore, StoreError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Replay errors.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// History could not be read.
    #[error("History unavailable: {0}")]
    Store(#[from] StoreError),

    /// The joining peer did not take the history.
    #[error("History delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Replay configuration.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Events read from the log per page.
    pub batch_size: usize,
    /// Longest wait for queue space per replayed event.
    pub send_timeout: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Lazy, finite cursor over a board's history up to a fixed boundary.
///
/// Once exhausted it stays exhausted; a new replay needs a new cursor.
pub struct Replay {
    store: Arc<dyn EventStore>,
    board: BoardId,
    cursor: u64,
    boundary: u64,
    batch_size: usize,
    buffer: VecDeque<DrawEvent>,
}

impl Replay {
    /// Offset one past the last event this replay will yield.
    #[must_use]
    pub fn boundary(&self) -> u64 {
        self.boundary
    }

    /// Number of events not yet yielded.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.boundary - self.cursor + self.buffer.len() as u64
    }

    /// Yield the next historical event, reading a page from the log when the
    /// buffer runs dry.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub async fn next(&mut self) -> Result<Option<DrawEvent>, StoreError> {
        if self.buffer.is_empty() && self.cursor < self.boundary {
            let want = (self.boundary - self.cursor).min(self.batch_size as u64) as usize;
            let mut page = self.store.read_from(&self.board, self.cursor, want).await?;
            page.truncate(want);
            if page.is_empty() {
                // Log shrank under us; treat the snapshot as exhausted.
                self.cursor = self.boundary;
            } else {
                self.cursor += page.len() as u64;
                self.buffer.extend(page);
            }
        }
        Ok(self.buffer.pop_front())
    }
}

/// Streams persisted history to joining connections.
pub struct ReplayCoordinator {
    store: Arc<dyn EventStore>,
    config: ReplayConfig,
}

impl ReplayCoordinator {
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, config: ReplayConfig) -> Self {
        Self { store, config }
    }

    /// Snapshot the log length of `board` and return a cursor up to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the log length cannot be read.
    pub async fn begin(&self, board: &str) -> Result<Replay, StoreError> {
        let boundary = self.store.len(board).await?;
        Ok(Replay {
            store: Arc::clone(&self.store),
            board: board.to_string(),
            cursor: 0,
            boundary,
            batch_size: self.config.batch_size.max(1),
            buffer: VecDeque::new(),
        })
    }

    /// Deliver the full history of the connection's board to it, in order.
    ///
    /// Returns the number of events delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or the peer stops accepting
    /// events; the connection must then not be registered.
    pub async fn replay(&self, connection: &Connection) -> Result<u64, ReplayError> {
        let started = Instant::now();
        let mut replay = self.begin(connection.board_id()).await?;
        let boundary = replay.boundary();

        let mut delivered = 0u64;
        while let Some(event) = replay.next().await? {
            connection
                .peer()
                .deliver_within(Arc::new(event), self.config.send_timeout)
                .await?;
            delivered += 1;
        }

        debug!(
            board = %connection.board_id(),
            connection = %connection.id(),
            boundary,
            delivered,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Replay complete"
        );

        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{ConnectionId, PeerHandle};
    use crate::store::MemoryEventStore;
    use async_trait::async_trait;
    use scribble_protocol::Point;

    async fn seeded(n: u64) -> Arc<MemoryEventStore> {
        let store = Arc::new(MemoryEventStore::new());
        for i in 0..n {
            let mut e = DrawEvent::new("b1", Point::new(i as f64, 0.0), Point::new(0.0, i as f64));
            e.sequence = i;
            store.append("b1", &e).await.unwrap();
        }
        store
    }

    fn coordinator(store: Arc<MemoryEventStore>, batch_size: usize) -> ReplayCoordinator {
        ReplayCoordinator::new(
            store,
            ReplayConfig {
                batch_size,
                send_timeout: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test]
    async fn test_cursor_stops_at_boundary() {
        let store = seeded(5).await;
        let coordinator = coordinator(store.clone(), 2);

        let mut replay = coordinator.begin("b1").await.unwrap();
        assert_eq!(replay.boundary(), 5);

        // Appended after the snapshot: must not be replayed.
        store
            .append("b1", &DrawEvent::new("b1", Point::default(), Point::default()))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(e) = replay.next().await.unwrap() {
            seen.push(e.sequence);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(replay.remaining(), 0);
        assert!(replay.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_delivers_in_order() {
        let coordinator = coordinator(seeded(7).await, 3);
        let (peer, mut rx) = PeerHandle::channel(16);
        let conn = Connection::new(ConnectionId::from("c1"), "b1", None, peer);

        assert_eq!(coordinator.replay(&conn).await.unwrap(), 7);

        let mut seen = Vec::new();
        while let Ok(e) = rx.try_recv() {
            seen.push(e.sequence);
        }
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_empty_board_replays_nothing() {
        let coordinator = coordinator(seeded(0).await, 3);
        let (peer, _rx) = PeerHandle::channel(1);
        let conn = Connection::new(ConnectionId::from("c1"), "fresh", None, peer);

        assert_eq!(coordinator.replay(&conn).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_aborts_replay() {
        let coordinator = coordinator(seeded(4).await, 4);
        let (peer, _rx) = PeerHandle::channel(2);
        let conn = Connection::new(ConnectionId::from("c1"), "b1", None, peer);

        assert!(matches!(
            coordinator.replay(&conn).await,
            Err(ReplayError::Delivery(DeliveryError::Timeout))
        ));
    }

    /// Ignores `limit` and returns everything from `start` on.
    struct OversizedPages(Arc<MemoryEventStore>);

    #[async_trait]
    impl EventStore for OversizedPages {
        async fn append(&self, board: &str, event: &DrawEvent) -> Result<(), StoreError> {
            self.0.append(board, event).await
        }
        async fn read_from(
            &self,
            board: &str,
            start: u64,
            _limit: usize,
        ) -> Result<Vec<DrawEvent>, StoreError> {
            self.0.read_from(board, start, usize::MAX).await
        }
        async fn len(&self, board: &str) -> Result<u64, StoreError> {
            self.0.len(board).await
        }
        fn name(&self) -> &'static str {
            "oversized"
        }
    }

    #[tokio::test]
    async fn test_oversized_pages_are_capped_at_boundary() {
        let store = seeded(6).await;
        let coordinator = ReplayCoordinator::new(
            Arc::new(OversizedPages(store.clone())),
            ReplayConfig {
                batch_size: 2,
                send_timeout: Duration::from_millis(100),
            },
        );

        let mut replay = coordinator.begin("b1").await.unwrap();
        store
            .append("b1", &DrawEvent::new("b1", Point::default(), Point::default()))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(e) = replay.next().await.unwrap() {
            assert!(replay.remaining() <= replay.boundary());
            seen.push(e.sequence);
        }
        assert_eq!(seen, (0..6).collect::<Vec<_>>());
        assert_eq!(replay.remaining(), 0);
    }
}

//! Shared fixtures for the Scribble benchmarks.

use scribble_core::{
    AllowAll, Connection, ConnectionId, ConnectionManager, EventStore, ManagerConfig, PeerHandle,
    PeerReceiver, Point, StrokeStyle,
};
use std::sync::Arc;

/// Segment `i` of a spiral, so consecutive segments join up.
#[must_use]
pub fn spiral_segment(i: usize) -> (Point, Point) {
    let at = |n: usize| {
        let t = n as f64 * 0.1;
        Point::new(500.0 + t.cos() * t * 4.0, 500.0 + t.sin() * t * 4.0)
    };
    (at(i), at(i + 1))
}

/// A typical pen style.
#[must_use]
pub fn pen() -> StrokeStyle {
    StrokeStyle::new("#1e90ff", 3.0)
}

/// An engine over `store` that lets everyone in.
#[must_use]
pub fn manager(store: Arc<dyn EventStore>) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(
        store,
        Arc::new(AllowAll),
        ManagerConfig::default(),
    ))
}

/// Join `peers` connections to `board`, each with a queue of `capacity`.
///
/// # Panics
///
/// Panics if a join fails.
pub async fn join_peers(
    manager: &ConnectionManager,
    board: &str,
    peers: usize,
    capacity: usize,
) -> Vec<(Connection, PeerReceiver)> {
    let mut joined = Vec::with_capacity(peers);
    for i in 0..peers {
        let (peer, rx) = PeerHandle::channel(capacity);
        let conn = manager
            .connect(ConnectionId::new(format!("peer-{i}")), board, None, peer)
            .await
            .expect("join");
        joined.push((conn.connection, rx));
    }
    joined
}

/// Discard everything queued for a peer; returns how many events there were.
pub fn drain(rx: &mut PeerReceiver) -> usize {
    let mut n = 0;
    while rx.try_recv().is_ok() {
        n += 1;
    }
    n
}

//! Live fan-out and persistence of draw events.
//!
//! For one board, sequencing, fan-out and the log append all happen while the
//! board's sequencer is held, which gives every recipient and the log the same
//! order. Fan-out itself never waits: each recipient gets a non-blocking
//! enqueue on its own queue, so one slow peer cannot delay the others.

use crate::event::{BoardId, DrawEvent};
use crate::peer::{ConnectionId, ConnectionState, DeliveryError};
use crate::registry::SessionRegistry;
use crate::store::{EventStore, StoreError};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Per-board sequencing state.
#[derive(Debug, Default)]
struct SequenceCursor {
    /// Next sequence to hand out; `None` until read from the log.
    next: Option<u64>,
    /// The last sequence handed out never reached the log.
    tail_lost: bool,
}

type Sequencer = Arc<Mutex<SequenceCursor>>;

/// What happened to one published event.
#[derive(Debug)]
pub struct PublishReport {
    /// The event as sequenced and delivered.
    pub event: Arc<DrawEvent>,
    /// Peers the event was enqueued for.
    pub delivered: usize,
    /// Peers that missed the event, and why.
    pub dropped: Vec<(ConnectionId, DeliveryError)>,
    /// Log failure, if any. A failed append happens after fan-out; a failure
    /// to read the board's next sequence means nothing was delivered.
    pub store_error: Option<StoreError>,
}

impl PublishReport {
    /// Whether the event reached the log.
    #[must_use]
    pub fn persisted(&self) -> bool {
        self.store_error.is_none()
    }
}

/// Routes events from one peer to the rest of its board and to the log.
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn EventStore>,
    sequencers: DashMap<BoardId, Sequencer>,
}

impl Broadcaster {
    /// Create a broadcaster over a registry and an event log.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<dyn EventStore>) -> Self {
        Self {
            registry,
            store,
            sequencers: DashMap::new(),
        }
    }

    fn sequencer(&self, board: &str) -> Sequencer {
        self.sequencers
            .entry(board.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Publish an event from `origin` to every other peer on its board, then
    /// append it to the log.
    ///
    /// The event's sequence is overwritten with the board's next sequence.
    /// Both fan-out and append are always attempted once the board is
    /// sequenced; neither failure is returned as an error.
    pub async fn publish(&self, origin: &ConnectionId, mut event: DrawEvent) -> PublishReport {
        let board = event.board_id.clone();
        let sequencer = self.sequencer(&board);
        let mut cursor = sequencer.lock().await;

        let sequence = match cursor.next {
            Some(n) => n,
            None => match self.store.next_sequence(&board).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(board = %board, error = %e, "Event log unavailable, draw event not sequenced");
                    return PublishReport {
                        event: Arc::new(event),
                        delivered: 0,
                        dropped: Vec::new(),
                        store_error: Some(e),
                    };
                }
            },
        };
        event.sequence = sequence;
        let event = Arc::new(event);

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for member in self.registry.members(&board) {
            if member.id() == origin || member.state() != ConnectionState::Joined {
                continue;
            }
            match member.peer().deliver(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(board = %board, connection = %member.id(), error = %e, "Delivery dropped");
                    if e == DeliveryError::Closed {
                        self.registry.leave(&board, &member);
                    }
                    dropped.push((member.id().clone(), e));
                }
            }
        }

        // The number is spent either way; a failed append leaves a gap.
        cursor.next = Some(sequence + 1);
        let store_error = match self.store.append(&board, &event).await {
            Ok(()) => {
                cursor.tail_lost = false;
                None
            }
            Err(e) => {
                warn!(board = %board, sequence, error = %e, "Failed to persist draw event");
                cursor.tail_lost = true;
                Some(e)
            }
        };
        drop(cursor);

        trace!(
            board = %board,
            sequence,
            recipients = delivered,
            dropped = dropped.len(),
            "Published draw event"
        );

        PublishReport {
            event,
            delivered,
            dropped,
            store_error,
        }
    }

    /// Forget the sequencer of a board with no live connections.
    ///
    /// A sequencer still held by an in-flight publish is kept, and so is one
    /// whose last number never reached the log: reseeding from the log would
    /// hand that number out again.
    pub fn release(&self, board: &str) {
        self.sequencers.remove_if(board, |_, sequencer| {
            Arc::strong_count(sequencer) == 1
                && self.registry.member_count(board) == 0
                && sequencer.try_lock().is_ok_and(|cursor| !cursor.tail_lost)
        });
    }
}

//! Durable, append-only log of draw events per board.
//!
//! The log has no logic beyond append and ordered range reads. Offsets are
//! 0-based positions within one board's log.

mod file;
mod memory;

pub use file::FileEventStore;
pub use memory::MemoryEventStore;

use crate::event::DrawEvent;
use async_trait::async_trait;
use thiserror::Error;

/// Event log errors. Every variant means the store is unavailable for the
/// operation that produced it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// The backend refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only event log keyed by board.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event to the end of a board's log.
    async fn append(&self, board: &str, event: &DrawEvent) -> Result<(), StoreError>;

    /// Read up to `limit` events starting at offset `start`, in append order.
    async fn read_from(
        &self,
        board: &str,
        start: u64,
        limit: usize,
    ) -> Result<Vec<DrawEvent>, StoreError>;

    /// Number of events in a board's log.
    async fn len(&self, board: &str) -> Result<u64, StoreError>;

    /// Sequence the next event of a board should carry: one past the last
    /// persisted event, or 0 for an empty log.
    ///
    /// Sequences can skip numbers after a failed append, so this is not the
    /// log length in general.
    async fn next_sequence(&self, board: &str) -> Result<u64, StoreError> {
        let len = self.len(board).await?;
        if len == 0 {
            return Ok(0);
        }
        let last = self.read_from(board, len - 1, 1).await?;
        Ok(last.first().map_or(len, |e| e.sequence.max(len - 1) + 1))
    }

    /// Make every appended event durable.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

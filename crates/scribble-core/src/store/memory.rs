//! In-process event log, used for tests and ephemeral servers.

use super::{EventStore, StoreError};
use crate::event::{BoardId, DrawEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Event log held in memory; lost on restart.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    boards: DashMap<BoardId, Arc<RwLock<Vec<DrawEvent>>>>,
}

impl MemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, board: &str) -> Option<Arc<RwLock<Vec<DrawEvent>>>> {
        self.boards.get(board).map(|l| l.value().clone())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, board: &str, event: &DrawEvent) -> Result<(), StoreError> {
        let log = self.boards.entry(board.to_string()).or_default().value().clone();
        log.write().await.push(event.clone());
        Ok(())
    }

    async fn read_from(
        &self,
        board: &str,
        start: u64,
        limit: usize,
    ) -> Result<Vec<DrawEvent>, StoreError> {
        let Some(log) = self.log(board) else {
            return Ok(Vec::new());
        };
        let events = log.read().await;
        Ok(events
            .iter()
            .skip(start as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn len(&self, board: &str) -> Result<u64, StoreError> {
        match self.log(board) {
            Some(log) => Ok(log.read().await.len() as u64),
            None => Ok(0),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

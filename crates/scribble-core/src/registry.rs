//! Session registry: which connections are live on which board.
//!
//! The registry is the only shared mutable table in the engine. Boards live in
//! a sharded map, so `join`, `leave` and `members` on one board serialize
//! against each other without unrelated boards contending.

use crate::event::BoardId;
use crate::peer::{Connection, ConnectionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The board already holds the maximum number of connections.
    #[error("Board is full: {0}")]
    BoardFull(String),

    /// Maximum number of live boards reached.
    #[error("Maximum boards reached")]
    MaxBoardsReached,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of boards with at least one connection.
    pub max_boards: usize,
    /// Maximum connections per board.
    pub max_members_per_board: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_boards: 10_000,
            max_members_per_board: 1_000,
        }
    }
}

/// Live connections registered under one board.
#[derive(Debug, Default)]
struct BoardSession {
    members: HashMap<ConnectionId, Connection>,
}

/// Process-wide map of board to live connections.
pub struct SessionRegistry {
    boards: DashMap<BoardId, BoardSession>,
    config: RegistryConfig,
}

impl SessionRegistry {
    /// Create a registry with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom limits.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating session registry with config: {:?}", config);
        Self {
            boards: DashMap::new(),
            config,
        }
    }

    /// Register a connection under a board.
    ///
    /// Returns `false` if the connection was already registered there.
    ///
    /// # Errors
    ///
    /// Returns an error if a board or member limit would be exceeded.
    pub fn join(&self, board: &str, connection: Connection) -> Result<bool, RegistryError> {
        // Limit check is racy across shards; a brief overshoot is tolerated.
        if !self.boards.contains_key(board) && self.boards.len() >= self.config.max_boards {
            return Err(RegistryError::MaxBoardsReached);
        }

        let mut session = self.boards.entry(board.to_string()).or_default();

        if session.members.contains_key(connection.id()) {
            debug!(board = %board, connection = %connection.id(), "Duplicate join ignored");
            return Ok(false);
        }

        if session.members.len() >= self.config.max_members_per_board {
            let empty = session.members.is_empty();
            drop(session);
            if empty {
                self.remove_if_empty(board);
            }
            return Err(RegistryError::BoardFull(board.to_string()));
        }

        let id = connection.id().clone();
        session.members.insert(id.clone(), connection);

        debug!(
            board = %board,
            connection = %id,
            members = session.members.len(),
            "Joined board"
        );

        Ok(true)
    }

    /// Remove a connection from a board.
    ///
    /// Only this very connection is removed: a later join that reused its id
    /// stays registered. Returns `false` if it was not registered; unknown
    /// connections are not an error.
    pub fn leave(&self, board: &str, connection: &Connection) -> bool {
        let removed = match self.boards.get_mut(board) {
            Some(mut session) => {
                let same = session
                    .members
                    .get(connection.id())
                    .is_some_and(|current| current.is_same(connection));
                if same {
                    session.members.remove(connection.id());
                }
                same
            }
            None => false,
        };

        if removed {
            debug!(board = %board, connection = %connection.id(), "Left board");
            self.remove_if_empty(board);
        }

        removed
    }

    fn remove_if_empty(&self, board: &str) {
        if let Entry::Occupied(entry) = self.boards.entry(board.to_string()) {
            if entry.get().members.is_empty() {
                entry.remove();
                debug!(board = %board, "Dropped empty board");
            }
        }
    }

    /// Snapshot of the connections registered under a board.
    ///
    /// The snapshot may be stale as soon as it is returned.
    #[must_use]
    pub fn members(&self, board: &str) -> Vec<Connection> {
        self.boards
            .get(board)
            .map(|s| s.members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Check whether a connection is registered under a board.
    #[must_use]
    pub fn contains(&self, board: &str, connection_id: &ConnectionId) -> bool {
        self.boards
            .get(board)
            .is_some_and(|s| s.members.contains_key(connection_id))
    }

    /// Number of connections on a board.
    #[must_use]
    pub fn member_count(&self, board: &str) -> usize {
        self.boards
            .get(board)
            .map(|s| s.members.len())
            .unwrap_or(0)
    }

    /// Names of all boards with live connections.
    #[must_use]
    pub fn board_ids(&self) -> Vec<BoardId> {
        self.boards.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove every connection and return them.
    pub fn drain(&self) -> Vec<Connection> {
        let boards = self.board_ids();
        let mut drained = Vec::new();
        for board in boards {
            if let Some((_, session)) = self.boards.remove(&board) {
                drained.extend(session.members.into_values());
            }
        }
        drained
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            board_count: self.boards.len(),
            connection_count: self.boards.iter().map(|s| s.members.len()).sum(),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Boards with at least one connection.
    pub board_count: usize,
    /// Registered connections across all boards.
    pub connection_count: usize,
}

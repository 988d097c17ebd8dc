//! Authorization gate consulted once per join.
//!
//! Granting access is someone else's job; the engine only asks whether a peer
//! may open a board and never caches the answer.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Decides whether a peer may access a board.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `identity` is whatever the transport authenticated, if anything.
    async fn is_authorized(&self, identity: Option<&str>, board: &str) -> bool;
}

/// Lets everyone onto every board.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn is_authorized(&self, _identity: Option<&str>, _board: &str) -> bool {
        true
    }
}

/// Static participant lists per board.
///
/// Boards without a list follow `open`: anyone may join an unlisted board when
/// it is set, nobody otherwise.
#[derive(Debug, Clone, Default)]
pub struct BoardAcl {
    boards: HashMap<String, HashSet<String>>,
    open: bool,
}

impl BoardAcl {
    #[must_use]
    pub fn new(open: bool) -> Self {
        Self {
            boards: HashMap::new(),
            open,
        }
    }

    /// Restrict `board` to the given participants.
    #[must_use]
    pub fn with_board<I, S>(mut self, board: impl Into<String>, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.boards.insert(
            board.into(),
            participants.into_iter().map(Into::into).collect(),
        );
        self
    }
}

#[async_trait]
impl Authorizer for BoardAcl {
    async fn is_authorized(&self, identity: Option<&str>, board: &str) -> bool {
        let allowed = match self.boards.get(board) {
            Some(participants) => identity.is_some_and(|id| participants.contains(id)),
            None => self.open,
        };
        debug!(board = %board, identity = ?identity, allowed, "Authorization checked");
        allowed
    }
}

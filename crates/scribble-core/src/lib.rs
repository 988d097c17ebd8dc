//! # scribble-core
//!
//! The real-time drawing synchronization engine behind Scribble.
//!
//! - **SessionRegistry** - Which connections are live on which board
//! - **Broadcaster** - Fan-out to the rest of a board, then append to the log
//! - **ReplayCoordinator** - Board history for late joiners, before live delivery
//! - **ConnectionManager** - Join / leave / disconnect transitions
//! - **EventStore** - Append-only per-board event log (memory or file)
//!
//! ## Architecture
//!
//! ```text
//!                ┌───────────────────┐   authorize   ┌─────────────┐
//!   transport ──▶│ ConnectionManager │──────────────▶│ Authorizer  │
//!                └───────────────────┘               └─────────────┘
//!                  │ join       │ publish
//!                  ▼            ▼
//!          ┌──────────────┐  ┌─────────────┐  members  ┌─────────────────┐
//!          │    Replay    │  │ Broadcaster │──────────▶│ SessionRegistry │
//!          │ Coordinator  │  └─────────────┘           └─────────────────┘
//!          └──────────────┘         │ append
//!                  │ read           ▼
//!                  └──────────▶┌────────────┐
//!                              │ EventStore │
//!                              └────────────┘
//! ```

pub mod auth;
pub mod broadcaster;
pub mod event;
pub mod lifecycle;
pub mod peer;
pub mod registry;
pub mod replay;
pub mod store;

pub use auth::{AllowAll, Authorizer, BoardAcl};
pub use broadcaster::{Broadcaster, PublishReport};
pub use event::{validate_board_id, BoardId, DrawEvent};
pub use lifecycle::{
    ConnectionManager, HistoryError, JoinError, Joined, ManagerConfig, PublishError,
};
pub use peer::{Connection, ConnectionId, ConnectionState, DeliveryError, PeerHandle, PeerReceiver};
pub use registry::{RegistryConfig, RegistryError, RegistryStats, SessionRegistry};
pub use replay::{Replay, ReplayConfig, ReplayCoordinator, ReplayError};
pub use scribble_protocol::{Point, StrokeStyle};
pub use store::{EventStore, FileEventStore, MemoryEventStore, StoreError};

//! # Retroboard - peer-to-peer retrospective board core
//!
//! A replicated retro board built on a CRDT document: card lifecycle with
//! drafts, per-emoji vote budgets, a shared timer and collaborative card
//! text, plus the connection resilience layer and the websocket signaling
//! relay that lets peers find each other.

pub mod board;
pub mod config;
pub mod connection;
pub mod error;
pub mod notify;

#[cfg(feature = "persistence")]
pub mod persistence;

#[cfg(feature = "relay")]
pub mod relay;

// Re-exports for convenience
pub use board::{
    BoardEvent, BoardSettings, BoardStore, Card, ColumnId, CommitOutcome, DraftSweeper,
    LocalPresence, Participant, PresenceMap, PresenceState, TextBinding, TimerState, VoteOutcome,
};
pub use config::BoardConfig;
pub use connection::{
    ConnectionManager, ConnectionPhase, ConnectionStatus, EndpointProber, PeerTransport,
    TransportEvent,
};
pub use error::{Advisory, BoardError, BoardResult};
pub use notify::{Disposer, Publisher};

#[cfg(feature = "persistence")]
pub use persistence::SnapshotManager;

#[cfg(feature = "relay")]
pub use relay::{RoomRegistry, SignalMessage};

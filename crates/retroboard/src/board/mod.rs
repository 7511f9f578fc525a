//! The replicated retro board: card lifecycle, votes, settings, timer,
//! collaborative card text and draft garbage collection.

pub mod card;
pub mod presence;
pub mod store;
pub mod sweep;
pub mod text;

pub use card::{Card, ColumnId, LEGACY_VOTE_EMOJI, REACTION_EMOJI};
pub use presence::{
    typing_claims, LocalPresence, Participant, PresenceMap, PresenceState, SessionId,
};
pub use store::{
    BoardEvent, BoardSettings, BoardStore, CommitOutcome, TimerState, VoteOutcome,
    ABANDONED_DRAFT_MS,
};
pub use sweep::DraftSweeper;
pub use text::{edit_region, EditRegion, TextBinding};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapRef, Out, ReadTxn, StateVector, TextPrelim,
    Transact, TransactionMut, Update,
};

use super::card::{Card, ColumnId};
use super::presence::{Participant, PresenceMap, PresenceState};
use super::text::{apply_edit, TextBinding};
use crate::config::BoardConfig;
use crate::error::{Advisory, BoardError, BoardResult};
use crate::notify::{Disposer, Publisher};

const TEXTS_KEY: &str = "cardTexts";
const SETTINGS_KEY: &str = "settings";
const TIMER_KEY: &str = "timer";

const SETTING_MAX_VOTES: &str = "maxVotes";
const SETTING_TIMER_ENABLED: &str = "timerEnabled";
const SETTING_TIMER_DURATION: &str = "timerDuration";

const TIMER_STARTED_AT: &str = "startedAt";
const TIMER_DURATION: &str = "duration";

/// Drafts idle longer than this are eligible for sweeping.
pub const ABANDONED_DRAFT_MS: i64 = 5 * 60 * 1000;

/// Board-level change notification, emitted after the mutation committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardEvent {
    /// The card sequence of one column changed.
    Cards(ColumnId),
    Settings,
    Timer,
    /// A remote update was merged; any part of the board may have changed.
    Remote,
}

/// Result of [`BoardStore::commit_card`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The card was blank and imageless; it was deleted instead.
    Deleted,
    NotFound,
}

/// Result of [`BoardStore::toggle_vote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Added,
    Removed,
    /// Adding would exceed the vote budget; reported as an advisory.
    Rejected,
    NotFound,
}

/// Shared timer state; active iff both fields are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerState {
    pub started_at: Option<i64>,
    pub duration_ms: Option<i64>,
}

impl TimerState {
    pub fn is_active(&self) -> bool {
        self.started_at.is_some() && self.duration_ms.is_some()
    }
}

/// Current board settings with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardSettings {
    pub max_votes: u32,
    pub timer_enabled: bool,
    pub timer_minutes: u32,
}

/// Replicated board store: card lifecycle, vote accounting, settings and
/// timer on top of one replicated document.
///
/// Every mutating operation runs as a single document transaction, so
/// observers never see intermediate state; board events and advisories are
/// published synchronously after the transaction has committed.
pub struct BoardStore {
    doc: Doc,
    room: String,
    columns: [(ColumnId, ArrayRef); 4],
    card_texts: MapRef,
    settings: MapRef,
    timer: MapRef,
    participant: Participant,
    presence: Arc<dyn PresenceMap>,
    config: BoardConfig,
    events: Publisher<BoardEvent>,
    advisories: Publisher<Advisory>,
    dirty: AtomicBool,
}

impl BoardStore {
    /// Open the board for `config.room`, creating settings lazily with
    /// defaults on first access.
    pub fn new(
        config: BoardConfig,
        participant: Participant,
        presence: Arc<dyn PresenceMap>,
    ) -> Self {
        let doc = Doc::new();
        let columns = ColumnId::ALL.map(|id| (id, doc.get_or_insert_array(id.key())));
        let card_texts = doc.get_or_insert_map(TEXTS_KEY);
        let settings = doc.get_or_insert_map(SETTINGS_KEY);
        let timer = doc.get_or_insert_map(TIMER_KEY);

        presence.set_local(PresenceState::new(&participant));

        let store = Self {
            doc,
            room: config.room.clone(),
            columns,
            card_texts,
            settings,
            timer,
            participant,
            presence,
            config,
            events: Publisher::new(),
            advisories: Publisher::new(),
            dirty: AtomicBool::new(false),
        };
        store.ensure_settings();
        info!(room = %store.room, "opened board");
        store
    }

    /// Room identifier this board belongs to.
    pub fn room(&self) -> &str {
        &self.room
    }

    /// The underlying replicated document, for transport integration.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Subscribe to board change events. Dropping the disposer unsubscribes.
    pub fn subscribe_changes(
        &self,
        callback: impl Fn(&BoardEvent) + Send + Sync + 'static,
    ) -> Disposer {
        self.events.subscribe(callback)
    }

    /// Subscribe to user-visible advisories (e.g. the vote cap).
    pub fn on_advisory(
        &self,
        callback: impl Fn(&Advisory) + Send + Sync + 'static,
    ) -> Disposer {
        self.advisories.subscribe(callback)
    }

    // ------------------------------------------------------------------
    // Card lifecycle
    // ------------------------------------------------------------------

    /// Create a Draft card at the column's tail, its text object seeded
    /// with `initial_text`. Always succeeds locally.
    pub fn create_card(&self, column: ColumnId, initial_text: &str) -> Card {
        let card_id = Uuid::new_v4().to_string();
        let text_id = format!("text-{}", card_id);
        let card = Card {
            id: card_id,
            text_id: text_id.clone(),
            text: initial_text.to_string(),
            created_by: self.participant.id.clone(),
            created_at: now_ms(),
            ..Default::default()
        };

        {
            let mut txn = self.doc.transact_mut();
            self.card_texts
                .insert(&mut txn, text_id, TextPrelim::new(initial_text));
            self.column(column).push_back(&mut txn, card.to_any());
        }
        debug!(card = %card.id, %column, "created draft card");
        self.changed(BoardEvent::Cards(column));
        card
    }

    /// All cards of a column, in order. Malformed entries are skipped.
    pub fn cards(&self, column: ColumnId) -> Vec<Card> {
        let txn = self.doc.transact();
        self.column(column)
            .iter(&txn)
            .filter_map(|out| match out {
                Out::Any(any) => match Card::from_any(&any) {
                    Ok(card) => Some(card),
                    Err(e) => {
                        warn!(%column, error = %e, "skipping malformed card");
                        None
                    }
                },
                _ => None,
            })
            .collect()
    }

    /// Look up one card by id.
    pub fn card(&self, column: ColumnId, card_id: &str) -> Option<Card> {
        let txn = self.doc.transact();
        find_card(&txn, self.column(column), card_id).map(|(_, card)| card)
    }

    /// Commit a Draft. A blank, imageless card is deleted instead, its
    /// text object released in the same transaction.
    pub fn commit_card(&self, column: ColumnId, card_id: &str) -> CommitOutcome {
        let outcome = {
            let mut txn = self.doc.transact_mut();
            let Some((index, mut card)) = find_card(&txn, self.column(column), card_id) else {
                return CommitOutcome::NotFound;
            };
            let content = self.text_content_in(&txn, &card.text_id).unwrap_or_default();
            if content.trim().is_empty() && card.image.is_none() {
                self.release_text(&mut txn, &card.text_id);
                self.column(column).remove(&mut txn, index);
                CommitOutcome::Deleted
            } else {
                card.is_committed = true;
                card.text = content;
                card.edited_at = Some(now_ms());
                self.replace_card(&mut txn, column, index, &card);
                CommitOutcome::Committed
            }
        };
        debug!(card = card_id, %column, ?outcome, "committed card");
        self.changed(BoardEvent::Cards(column));
        outcome
    }

    /// Remove a card and release its text object atomically.
    pub fn delete_card(&self, column: ColumnId, card_id: &str) -> bool {
        let removed = {
            let mut txn = self.doc.transact_mut();
            match find_card(&txn, self.column(column), card_id) {
                Some((index, card)) => {
                    self.release_text(&mut txn, &card.text_id);
                    self.column(column).remove(&mut txn, index);
                    true
                }
                None => false,
            }
        };
        if removed {
            debug!(card = card_id, %column, "deleted card");
            self.changed(BoardEvent::Cards(column));
        }
        removed
    }

    /// Attach or clear a card's image. Clearing the image of a blank card
    /// deletes the card, matching commit semantics.
    pub fn set_card_image(&self, column: ColumnId, card_id: &str, image: Option<String>) -> bool {
        let found = {
            let mut txn = self.doc.transact_mut();
            let Some((index, mut card)) = find_card(&txn, self.column(column), card_id) else {
                return false;
            };
            card.image = image;
            let content = self.text_content_in(&txn, &card.text_id).unwrap_or_default();
            if content.trim().is_empty() && card.image.is_none() {
                self.release_text(&mut txn, &card.text_id);
                self.column(column).remove(&mut txn, index);
            } else {
                self.replace_card(&mut txn, column, index, &card);
            }
            true
        };
        self.changed(BoardEvent::Cards(column));
        found
    }

    /// Empty all four columns in one transaction, releasing every text
    /// object the removed cards referenced. Confirmation is the caller's
    /// concern.
    pub fn clear_board(&self) {
        {
            let mut txn = self.doc.transact_mut();
            for (_, column) in &self.columns {
                let cards: Vec<Card> = column
                    .iter(&txn)
                    .filter_map(|out| match out {
                        Out::Any(any) => Card::from_any(&any).ok(),
                        _ => None,
                    })
                    .collect();
                for card in &cards {
                    self.release_text(&mut txn, &card.text_id);
                }
                let len = column.len(&txn);
                if len > 0 {
                    column.remove_range(&mut txn, 0, len);
                }
            }
        }
        info!(room = %self.room, "cleared board");
        for column in ColumnId::ALL {
            self.changed(BoardEvent::Cards(column));
        }
    }

    // ------------------------------------------------------------------
    // Votes
    // ------------------------------------------------------------------

    /// Idempotent reaction toggle for the local user.
    ///
    /// Legacy single-emoji votes migrate into the reaction map on first
    /// touch of the card. Additions beyond the vote budget are rejected
    /// through the advisory channel; removals are always allowed. The
    /// denormalized total is recomputed either way.
    pub fn toggle_vote(&self, column: ColumnId, card_id: &str, emoji: &str) -> VoteOutcome {
        let user = self.participant.id.clone();
        let max_votes = self.settings().max_votes;

        let (outcome, changed) = {
            let mut txn = self.doc.transact_mut();
            let Some((index, mut card)) = find_card(&txn, self.column(column), card_id) else {
                return VoteOutcome::NotFound;
            };
            let migrated = card.migrate_legacy_votes();

            if card.has_reaction(emoji, &user) {
                if let Some(users) = card.reactions.get_mut(emoji) {
                    users.retain(|u| u != &user);
                    if users.is_empty() {
                        card.reactions.remove(emoji);
                    }
                }
                card.votes = card.total_reactions();
                self.replace_card(&mut txn, column, index, &card);
                (VoteOutcome::Removed, true)
            } else if self.votes_used_by(&txn, &user) >= max_votes as usize {
                // The migration is a touch and is kept even when the new
                // reaction is rejected.
                if migrated {
                    card.votes = card.total_reactions();
                    self.replace_card(&mut txn, column, index, &card);
                }
                (VoteOutcome::Rejected, migrated)
            } else {
                card.reactions
                    .entry(emoji.to_string())
                    .or_default()
                    .push(user.clone());
                card.votes = card.total_reactions();
                self.replace_card(&mut txn, column, index, &card);
                (VoteOutcome::Added, true)
            }
        };

        if changed {
            self.changed(BoardEvent::Cards(column));
        }
        if outcome == VoteOutcome::Rejected {
            debug!(card = card_id, user = %user, "vote rejected by budget");
            self.advisories.emit(&Advisory::VoteLimitExceeded { max_votes });
        }
        outcome
    }

    /// Votes the given user holds across the whole board, legacy votes
    /// counted as if migrated.
    fn votes_used_by<T: ReadTxn>(&self, txn: &T, user: &str) -> usize {
        self.columns
            .iter()
            .flat_map(|(_, column)| column.iter(txn).collect::<Vec<_>>())
            .filter_map(|out| match out {
                Out::Any(any) => Card::from_any(&any).ok(),
                _ => None,
            })
            .map(|card| card.reactions_by_user(user))
            .sum()
    }

    // ------------------------------------------------------------------
    // Collaborative text
    // ------------------------------------------------------------------

    /// Current content of a card's text object.
    pub fn text_content(&self, text_id: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.text_content_in(&txn, text_id)
    }

    /// Converge a text object with new local buffer content: one delete
    /// plus one insert in a single transaction.
    pub fn update_text(&self, text_id: &str, new_text: &str) -> BoardResult<()> {
        let text = {
            let txn = self.doc.transact();
            match self.card_texts.get(&txn, text_id) {
                Some(Out::YText(text)) => text,
                _ => {
                    return Err(BoardError::TextNotFound {
                        id: text_id.to_string(),
                    })
                }
            }
        };
        apply_edit(&self.doc, &text, new_text);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Bind an edit buffer to a card's text object.
    pub fn bind_text(
        &self,
        text_id: &str,
        on_remote: impl Fn(&str) + Send + Sync + 'static,
    ) -> BoardResult<TextBinding> {
        TextBinding::attach(
            self.doc.clone(),
            self.card_texts.clone(),
            text_id,
            Arc::new(on_remote),
        )
    }

    fn text_content_in<T: ReadTxn>(&self, txn: &T, text_id: &str) -> Option<String> {
        match self.card_texts.get(txn, text_id) {
            Some(Out::YText(text)) => Some(text.get_string(txn)),
            _ => None,
        }
    }

    fn release_text(&self, txn: &mut TransactionMut, text_id: &str) {
        if !text_id.is_empty() {
            self.card_texts.remove(txn, text_id);
        }
    }

    // ------------------------------------------------------------------
    // Settings and timer
    // ------------------------------------------------------------------

    /// Current settings with defaults applied.
    pub fn settings(&self) -> BoardSettings {
        let txn = self.doc.transact();
        BoardSettings {
            max_votes: read_i64(&txn, &self.settings, SETTING_MAX_VOTES)
                .map_or(self.config.max_votes, |v| v.max(1) as u32),
            timer_enabled: read_bool(&txn, &self.settings, SETTING_TIMER_ENABLED)
                .unwrap_or(self.config.timer_enabled),
            timer_minutes: read_i64(&txn, &self.settings, SETTING_TIMER_DURATION)
                .map_or(self.config.timer_minutes, |v| v.max(1) as u32),
        }
    }

    pub fn set_max_votes(&self, max_votes: u32) {
        self.set_setting(SETTING_MAX_VOTES, Any::BigInt(i64::from(max_votes.max(1))));
    }

    pub fn set_timer_enabled(&self, enabled: bool) {
        self.set_setting(SETTING_TIMER_ENABLED, Any::Bool(enabled));
    }

    pub fn set_timer_minutes(&self, minutes: u32) {
        self.set_setting(
            SETTING_TIMER_DURATION,
            Any::BigInt(i64::from(minutes.max(1))),
        );
    }

    fn set_setting(&self, key: &str, value: Any) {
        {
            let mut txn = self.doc.transact_mut();
            self.settings.insert(&mut txn, key, value);
        }
        self.changed(BoardEvent::Settings);
    }

    /// Populate missing settings with defaults; existing values win.
    fn ensure_settings(&self) {
        let mut txn = self.doc.transact_mut();
        if self.settings.get(&txn, SETTING_MAX_VOTES).is_none() {
            self.settings.insert(
                &mut txn,
                SETTING_MAX_VOTES,
                Any::BigInt(i64::from(self.config.max_votes)),
            );
        }
        if self.settings.get(&txn, SETTING_TIMER_ENABLED).is_none() {
            self.settings.insert(
                &mut txn,
                SETTING_TIMER_ENABLED,
                Any::Bool(self.config.timer_enabled),
            );
        }
        if self.settings.get(&txn, SETTING_TIMER_DURATION).is_none() {
            self.settings.insert(
                &mut txn,
                SETTING_TIMER_DURATION,
                Any::BigInt(i64::from(self.config.timer_minutes)),
            );
        }
    }

    /// Shared timer state.
    pub fn timer(&self) -> TimerState {
        let txn = self.doc.transact();
        TimerState {
            started_at: read_i64(&txn, &self.timer, TIMER_STARTED_AT),
            duration_ms: read_i64(&txn, &self.timer, TIMER_DURATION),
        }
    }

    /// Start the shared timer with the configured duration. No-op while a
    /// timer is already running.
    pub fn start_timer(&self) {
        if self.timer().is_active() {
            return;
        }
        let duration_ms = i64::from(self.settings().timer_minutes) * 60 * 1000;
        {
            let mut txn = self.doc.transact_mut();
            self.timer
                .insert(&mut txn, TIMER_STARTED_AT, Any::BigInt(now_ms()));
            self.timer
                .insert(&mut txn, TIMER_DURATION, Any::BigInt(duration_ms));
        }
        self.changed(BoardEvent::Timer);
    }

    /// Clear the shared timer; idempotent.
    pub fn stop_timer(&self) {
        {
            let mut txn = self.doc.transact_mut();
            self.timer.insert(&mut txn, TIMER_STARTED_AT, Any::Null);
            self.timer.insert(&mut txn, TIMER_DURATION, Any::Null);
        }
        self.changed(BoardEvent::Timer);
    }

    /// Dismiss an elapsed timer; same replicated effect as stopping.
    pub fn dismiss_timer(&self) {
        self.stop_timer();
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Update the local peer's ephemeral typing state.
    pub fn set_presence(&self, is_typing: bool, card_id: Option<String>) {
        let mut state = self
            .presence
            .local()
            .unwrap_or_else(|| PresenceState::new(&self.participant));
        state.is_typing = is_typing;
        state.typing_card_id = card_id;
        self.presence.set_local(state);
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Delete empty, uncommitted, imageless cards idle longer than
    /// [`ABANDONED_DRAFT_MS`], unless a live presence claims the card via
    /// its typing state. Returns the number of cards removed.
    pub fn sweep_abandoned_drafts(&self, claimed: &HashSet<String>, now_ms: i64) -> usize {
        let mut removed_total = 0;
        for (id, _) in &self.columns {
            let column = *id;
            let removed = {
                let mut txn = self.doc.transact_mut();
                let cards: Vec<(u32, Card)> = indexed_cards(&txn, self.column(column));
                let mut removed = 0;
                for (index, card) in cards.into_iter().rev() {
                    if card.is_committed || card.image.is_some() || claimed.contains(&card.id) {
                        continue;
                    }
                    let content = self
                        .text_content_in(&txn, &card.text_id)
                        .unwrap_or_else(|| card.text.clone());
                    if !content.trim().is_empty() {
                        continue;
                    }
                    let idle_since = card.edited_at.unwrap_or(card.created_at);
                    if now_ms - idle_since <= ABANDONED_DRAFT_MS {
                        continue;
                    }
                    self.release_text(&mut txn, &card.text_id);
                    self.column(column).remove(&mut txn, index);
                    removed += 1;
                }
                removed
            };
            if removed > 0 {
                info!(%column, removed, "swept abandoned drafts");
                self.changed(BoardEvent::Cards(column));
                removed_total += removed;
            }
        }
        removed_total
    }

    /// One-time migration: cards without a text reference get a text
    /// object seeded from their legacy snapshot and become Committed.
    /// Returns the number of cards migrated.
    pub fn migrate_legacy_cards(&self) -> usize {
        let mut migrated_total = 0;
        for (id, _) in &self.columns {
            let column = *id;
            let migrated = {
                let mut txn = self.doc.transact_mut();
                let cards: Vec<(u32, Card)> = indexed_cards(&txn, self.column(column));
                let mut migrated = 0;
                for (index, mut card) in cards {
                    if !card.text_id.is_empty() {
                        continue;
                    }
                    let text_id = format!("text-{}", card.id);
                    self.card_texts.insert(
                        &mut txn,
                        text_id.clone(),
                        TextPrelim::new(card.text.as_str()),
                    );
                    card.text_id = text_id;
                    card.is_committed = true;
                    self.replace_card(&mut txn, column, index, &card);
                    migrated += 1;
                }
                migrated
            };
            if migrated > 0 {
                info!(%column, migrated, "migrated legacy cards");
                self.changed(BoardEvent::Cards(column));
                migrated_total += migrated;
            }
        }
        migrated_total
    }

    // ------------------------------------------------------------------
    // Synchronization surface
    // ------------------------------------------------------------------

    /// Encoded state vector describing what this replica already has.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Update containing everything the remote replica is missing.
    pub fn encode_update_since(&self, remote_state_vector: &[u8]) -> BoardResult<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| BoardError::Update(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Full-state snapshot update.
    pub fn encode_snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge an update received from a peer or loaded from storage.
    pub fn apply_update(&self, update: &[u8]) -> BoardResult<()> {
        {
            let update =
                Update::decode_v1(update).map_err(|e| BoardError::Update(e.to_string()))?;
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| BoardError::Update(e.to_string()))?;
        }
        self.changed(BoardEvent::Remote);
        Ok(())
    }

    /// Whether the board changed since the last flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Mark the board as flushed.
    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    // ------------------------------------------------------------------

    fn column(&self, id: ColumnId) -> &ArrayRef {
        &self.columns[id as usize].1
    }

    fn replace_card(&self, txn: &mut TransactionMut, column: ColumnId, index: u32, card: &Card) {
        let array = self.column(column);
        array.remove(txn, index);
        array.insert(txn, index, card.to_any());
    }

    fn changed(&self, event: BoardEvent) {
        self.dirty.store(true, Ordering::Release);
        self.events.emit(&event);
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn find_card<T: ReadTxn>(txn: &T, column: &ArrayRef, card_id: &str) -> Option<(u32, Card)> {
    column
        .iter(txn)
        .enumerate()
        .find_map(|(index, out)| match out {
            Out::Any(any) => Card::from_any(&any)
                .ok()
                .filter(|card| card.id == card_id)
                .map(|card| (index as u32, card)),
            _ => None,
        })
}

fn indexed_cards<T: ReadTxn>(txn: &T, column: &ArrayRef) -> Vec<(u32, Card)> {
    column
        .iter(txn)
        .enumerate()
        .filter_map(|(index, out)| match out {
            Out::Any(any) => Card::from_any(&any).ok().map(|card| (index as u32, card)),
            _ => None,
        })
        .collect()
}

fn read_i64<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<i64> {
    match map.get(txn, key) {
        Some(Out::Any(Any::BigInt(v))) => Some(v),
        Some(Out::Any(Any::Number(v))) => Some(v as i64),
        _ => None,
    }
}

fn read_bool<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<bool> {
    match map.get(txn, key) {
        Some(Out::Any(Any::Bool(v))) => Some(v),
        _ => None,
    }
}

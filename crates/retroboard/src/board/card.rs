use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use yrs::Any;

use crate::error::{BoardError, BoardResult};

/// The four fixed board columns, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnId {
    Kudos,
    Good,
    Improve,
    Action,
}

impl ColumnId {
    pub const ALL: [ColumnId; 4] = [
        ColumnId::Kudos,
        ColumnId::Good,
        ColumnId::Improve,
        ColumnId::Action,
    ];

    /// Key of the replicated sequence backing this column.
    pub fn key(self) -> &'static str {
        match self {
            ColumnId::Kudos => "kudos",
            ColumnId::Good => "good",
            ColumnId::Improve => "improve",
            ColumnId::Action => "action",
        }
    }
}

impl std::fmt::Display for ColumnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Reaction categories offered by the UI.
pub const REACTION_EMOJI: [&str; 3] = ["👍", "❓", "❤️"];

/// Legacy single-emoji votes migrate into this reaction category.
pub const LEGACY_VOTE_EMOJI: &str = "👍";

/// A note card as stored inside a column sequence.
///
/// Field names are camelCase on the wire for compatibility with boards
/// created by earlier deployments. Decoding is lenient: legacy cards may
/// lack `textId`, `reactions` or `editedAt` entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Card {
    pub id: String,
    /// Handle into the `cardTexts` map; empty on unmigrated legacy cards.
    pub text_id: String,
    /// Snapshot of the collaborative text, refreshed on commit.
    pub text: String,
    pub is_committed: bool,
    /// Denormalized total across all reaction categories.
    pub votes: u32,
    /// Legacy single-emoji vote representation, drained by migration.
    pub voted_by: Vec<String>,
    /// Reaction category -> voting user ids.
    pub reactions: BTreeMap<String, Vec<String>>,
    pub image: Option<String>,
    pub created_by: String,
    pub created_at: i64,
    pub edited_at: Option<i64>,
}

impl Default for Card {
    fn default() -> Self {
        Self {
            id: String::new(),
            text_id: String::new(),
            text: String::new(),
            is_committed: false,
            votes: 0,
            voted_by: Vec::new(),
            reactions: BTreeMap::new(),
            image: None,
            created_by: String::new(),
            created_at: 0,
            edited_at: None,
        }
    }
}

impl Card {
    /// Fold any legacy `votedBy` entries into the reaction map.
    ///
    /// Each legacy vote becomes exactly one entry in the legacy reaction
    /// category; users already present there are not counted twice.
    /// Returns true if the card changed.
    pub fn migrate_legacy_votes(&mut self) -> bool {
        if self.voted_by.is_empty() {
            return false;
        }
        let entry = self
            .reactions
            .entry(LEGACY_VOTE_EMOJI.to_string())
            .or_default();
        for user in self.voted_by.drain(..) {
            if !entry.contains(&user) {
                entry.push(user);
            }
        }
        true
    }

    /// Whether `user` currently holds a reaction of category `emoji`.
    pub fn has_reaction(&self, emoji: &str, user: &str) -> bool {
        self.reactions
            .get(emoji)
            .is_some_and(|users| users.iter().any(|u| u == user))
    }

    /// Total reactions across all categories (the denormalized count).
    pub fn total_reactions(&self) -> u32 {
        self.reactions.values().map(|users| users.len() as u32).sum()
    }

    /// Reactions held by `user` on this card, viewed as if migrated.
    ///
    /// Legacy votes count once: a user appearing in both `votedBy` and the
    /// legacy reaction category consumes a single vote.
    pub fn reactions_by_user(&self, user: &str) -> usize {
        let mut card = self.clone();
        card.migrate_legacy_votes();
        card.reactions
            .values()
            .filter(|users| users.iter().any(|u| u == user))
            .count()
    }

    /// Encode for storage inside a replicated sequence.
    pub fn to_any(&self) -> Any {
        let json = serde_json::to_value(self).expect("card serialization is infallible");
        json_to_any(&json)
    }

    /// Decode from a replicated sequence entry.
    pub fn from_any(value: &Any) -> BoardResult<Card> {
        let card: Card = serde_json::from_value(any_to_json(value))?;
        if card.id.is_empty() {
            return Err(BoardError::MalformedCard {
                reason: "missing card id".to_string(),
            });
        }
        Ok(card)
    }
}

/// Convert a JSON value into the replicated document's value type.
pub(crate) fn json_to_any(value: &JsonValue) -> Any {
    match value {
        JsonValue::Null => Any::Null,
        JsonValue::Bool(b) => Any::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Any::BigInt(i)
            } else {
                Any::Number(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => Any::from(s.as_str()),
        JsonValue::Array(items) => {
            let converted: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(Arc::from(converted))
        }
        JsonValue::Object(fields) => {
            let converted: HashMap<String, Any> = fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect();
            Any::Map(Arc::new(converted))
        }
    }
}

/// Convert a replicated value back into JSON.
///
/// Whole floats collapse to integers so that numbers written by peers
/// using floating-point encodings still decode into integer fields.
pub(crate) fn any_to_json(value: &Any) -> JsonValue {
    match value {
        Any::Null | Any::Undefined => JsonValue::Null,
        Any::Bool(b) => JsonValue::Bool(*b),
        Any::Number(f) => {
            if f.fract() == 0.0 && f.is_finite() && f.abs() < i64::MAX as f64 {
                JsonValue::from(*f as i64)
            } else {
                serde_json::Number::from_f64(*f)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            }
        }
        Any::BigInt(i) => JsonValue::from(*i),
        Any::String(s) => JsonValue::String(s.to_string()),
        Any::Buffer(bytes) => JsonValue::Array(
            bytes.iter().map(|b| JsonValue::from(*b)).collect(),
        ),
        Any::Array(items) => JsonValue::Array(items.iter().map(any_to_json).collect()),
        Any::Map(fields) => JsonValue::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
    }
}

use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Identity of the local participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub color: String,
}

/// Ephemeral per-peer state, replicated only to live peers.
///
/// Presence is deliberately decoupled from the durable document: records
/// are keyed by transport session and vanish when the session ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub user_id: String,
    pub name: String,
    pub color: String,
    pub is_typing: bool,
    pub typing_card_id: Option<String>,
}

impl PresenceState {
    pub fn new(participant: &Participant) -> Self {
        Self {
            user_id: participant.id.clone(),
            name: participant.name.clone(),
            color: participant.color.clone(),
            is_typing: false,
            typing_card_id: None,
        }
    }
}

/// Session identifier assigned by the peer transport.
pub type SessionId = u64;

/// Seam to the peer transport's ephemeral presence map.
///
/// The real implementation lives in the transport provider; the board core
/// only reads peer records and writes the local one.
pub trait PresenceMap: Send + Sync {
    /// Replace the local session's presence record.
    fn set_local(&self, state: PresenceState);

    /// The local session's current record, if one was ever set.
    fn local(&self) -> Option<PresenceState>;

    /// Records of all other live sessions.
    fn peers(&self) -> Vec<(SessionId, PresenceState)>;
}

/// Card ids claimed as "being typed in" by any live session, local included.
pub fn typing_claims(presence: &dyn PresenceMap) -> HashSet<String> {
    let mut claims = HashSet::new();
    if let Some(local) = presence.local() {
        claims.extend(local.typing_card_id);
    }
    for (_, peer) in presence.peers() {
        claims.extend(peer.typing_card_id);
    }
    claims
}

/// In-process presence map used in tests and in local-only mode.
pub struct LocalPresence {
    session: SessionId,
    records: DashMap<SessionId, PresenceState>,
}

impl LocalPresence {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            records: DashMap::new(),
        }
    }

    /// Insert or replace a simulated peer record.
    pub fn set_peer(&self, session: SessionId, state: PresenceState) {
        self.records.insert(session, state);
    }

    /// Drop a session's record, as a transport would on disconnect.
    pub fn remove(&self, session: SessionId) {
        self.records.remove(&session);
    }
}

impl PresenceMap for LocalPresence {
    fn set_local(&self, state: PresenceState) {
        self.records.insert(self.session, state);
    }

    fn local(&self) -> Option<PresenceState> {
        self.records.get(&self.session).map(|r| r.value().clone())
    }

    fn peers(&self) -> Vec<(SessionId, PresenceState)> {
        self.records
            .iter()
            .filter(|entry| *entry.key() != self.session)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: &str) -> Participant {
        Participant {
            id: id.to_string(),
            name: format!("Anonymous {}", id),
            color: "#ff8800".to_string(),
        }
    }

    #[test]
    fn local_record_is_not_a_peer() {
        let presence = LocalPresence::new(1);
        presence.set_local(PresenceState::new(&participant("u1")));

        assert_eq!(presence.local().unwrap().user_id, "u1");
        assert!(presence.peers().is_empty());
    }

    #[test]
    fn typing_claims_cover_local_and_peers() {
        let presence = LocalPresence::new(1);

        let mut local = PresenceState::new(&participant("u1"));
        local.is_typing = true;
        local.typing_card_id = Some("card-a".to_string());
        presence.set_local(local);

        let mut peer = PresenceState::new(&participant("u2"));
        peer.is_typing = true;
        peer.typing_card_id = Some("card-b".to_string());
        presence.set_peer(2, peer);
        presence.set_peer(3, PresenceState::new(&participant("u3")));

        let claims = typing_claims(&presence);
        assert_eq!(claims.len(), 2);
        assert!(claims.contains("card-a"));
        assert!(claims.contains("card-b"));

        presence.remove(2);
        assert!(!typing_claims(&presence).contains("card-b"));
    }
}

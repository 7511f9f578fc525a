use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Concurrent websocket connections allowed per source address per room.
pub const MAX_CONNS_PER_ADDR: usize = 20;

/// All signaling rooms served by this relay, created lazily by name.
///
/// Rooms are never evicted: an empty room is a few hundred bytes and its
/// name will usually be visited again.
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<RelayRoom>>,
    max_per_addr: usize,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::with_limit(MAX_CONNS_PER_ADDR)
    }

    /// Registry with a custom per-address connection cap.
    pub fn with_limit(max_per_addr: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            max_per_addr,
        }
    }

    /// Get or create the room with the given name.
    pub fn room(&self, name: &str) -> Arc<RelayRoom> {
        self.rooms
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(room = name, "creating signaling room");
                Arc::new(RelayRoom::new(name, self.max_per_addr))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct PeerSocket {
    addr: String,
    topics: HashSet<String>,
    sender: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct RoomState {
    sockets: HashMap<Uuid, PeerSocket>,
    addr_counts: HashMap<String, usize>,
}

/// One signaling room: a set of live sockets and their topic subscriptions.
///
/// All bookkeeping lives behind one async mutex; operations are short and
/// never await while holding it.
pub struct RelayRoom {
    name: String,
    max_per_addr: usize,
    state: Mutex<RoomState>,
}

impl RelayRoom {
    fn new(name: &str, max_per_addr: usize) -> Self {
        Self {
            name: name.to_string(),
            max_per_addr,
            state: Mutex::new(RoomState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reserve a slot for a new socket from `addr`.
    ///
    /// Called before the protocol upgrade completes so that an address at
    /// its cap cannot race additional sockets in. Returns `None` when the
    /// per-address cap is reached.
    pub async fn try_admit(&self, addr: &str, sender: mpsc::UnboundedSender<String>) -> Option<Uuid> {
        let mut state = self.state.lock().await;
        let count = state.addr_counts.get(addr).copied().unwrap_or(0);
        if count >= self.max_per_addr {
            warn!(room = %self.name, addr, count, "rejecting connection over per-address cap");
            return None;
        }
        let id = Uuid::new_v4();
        state.addr_counts.insert(addr.to_string(), count + 1);
        state.sockets.insert(
            id,
            PeerSocket {
                addr: addr.to_string(),
                topics: HashSet::new(),
                sender,
            },
        );
        debug!(room = %self.name, %id, addr, "admitted socket");
        Some(id)
    }

    /// Add topic subscriptions for a socket.
    pub async fn subscribe(&self, id: Uuid, topics: Vec<String>) {
        let mut state = self.state.lock().await;
        if let Some(socket) = state.sockets.get_mut(&id) {
            socket.topics.extend(topics);
        }
    }

    /// Remove topic subscriptions from a socket.
    pub async fn unsubscribe(&self, id: Uuid, topics: Vec<String>) {
        let mut state = self.state.lock().await;
        if let Some(socket) = state.sockets.get_mut(&id) {
            for topic in &topics {
                socket.topics.remove(topic);
            }
        }
    }

    /// Forward a raw frame to every other socket subscribed to `topic`.
    /// Returns the number of sockets the frame was queued for.
    pub async fn publish(&self, sender_id: Uuid, topic: &str, raw: &str) -> usize {
        let state = self.state.lock().await;
        let mut delivered = 0;
        for (id, socket) in &state.sockets {
            if *id == sender_id || !socket.topics.contains(topic) {
                continue;
            }
            // A closed receiver just means the socket is on its way out;
            // its disconnect cleanup handles the rest.
            if socket.sender.send(raw.to_string()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Queue a frame for one specific socket.
    pub async fn send_to(&self, id: Uuid, frame: &str) -> bool {
        let state = self.state.lock().await;
        state
            .sockets
            .get(&id)
            .is_some_and(|socket| socket.sender.send(frame.to_string()).is_ok())
    }

    /// Remove a socket, dropping its subscriptions and releasing its
    /// per-address slot. Zero-count addresses are dropped entirely.
    pub async fn disconnect(&self, id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(socket) = state.sockets.remove(&id) {
            match state.addr_counts.get_mut(&socket.addr) {
                Some(count) if *count > 1 => *count -= 1,
                _ => {
                    state.addr_counts.remove(&socket.addr);
                }
            }
            debug!(room = %self.name, %id, addr = %socket.addr, "socket disconnected");
        }
    }

    /// Number of live sockets in the room.
    pub async fn socket_count(&self) -> usize {
        self.state.lock().await.sockets.len()
    }

    /// Live connection count for one source address.
    pub async fn connections_from(&self, addr: &str) -> usize {
        self.state
            .lock()
            .await
            .addr_counts
            .get(addr)
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    async fn topics_of(&self, id: Uuid) -> HashSet<String> {
        self.state
            .lock()
            .await
            .sockets
            .get(&id)
            .map(|socket| socket.topics.clone())
            .unwrap_or_default()
    }
}

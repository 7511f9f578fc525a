use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{SignalMessage, PONG_FRAME};
use super::room::{RelayRoom, RoomRegistry};
use crate::config::DEFAULT_ROOM;

#[derive(Debug, Deserialize)]
pub struct SignalParams {
    pub room: Option<String>,
}

/// Websocket upgrade that never rejects: `None` on a plain HTTP request,
/// letting the handler answer 426 itself.
pub struct MaybeUpgrade(pub Option<WebSocketUpgrade>);

impl<S> FromRequestParts<S> for MaybeUpgrade
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            WebSocketUpgrade::from_request_parts(parts, state)
                .await
                .ok(),
        ))
    }
}

/// Peer address, when the server was started with connect info.
pub struct PeerAddr(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for PeerAddr
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
                .await
                .ok()
                .map(|ConnectInfo(peer)| peer),
        ))
    }
}

/// Signaling endpoint: upgrades to a websocket and joins the requested
/// room.
///
/// Plain HTTP requests get 426 so that health checkers and curious
/// browsers see a clear answer. Admission is reserved before the upgrade
/// completes; an address at its cap gets 429 instead of an upgrade.
pub async fn signal_handler(
    MaybeUpgrade(ws): MaybeUpgrade,
    Query(params): Query<SignalParams>,
    headers: HeaderMap,
    PeerAddr(peer): PeerAddr,
    State(registry): State<Arc<RoomRegistry>>,
) -> Response {
    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "Expected Upgrade: websocket").into_response();
    };

    let addr = client_addr(&headers, peer);
    let room_name = params.room.as_deref().unwrap_or(DEFAULT_ROOM);
    let room = registry.room(room_name);

    let (outbox, outbox_rx) = mpsc::unbounded_channel::<String>();
    let Some(peer_id) = room.try_admit(&addr, outbox).await else {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            "Too many connections from this address",
        )
            .into_response();
    };

    info!(room = room_name, %peer_id, addr, "signaling connection accepted");
    // A handshake that never completes must still release the reserved
    // admission slot.
    let ws = ws.on_failed_upgrade({
        let room = room.clone();
        move |error| {
            debug!(%peer_id, error = %error, "upgrade failed, releasing slot");
            tokio::spawn(async move {
                room.disconnect(peer_id).await;
            });
        }
    });
    ws.on_upgrade(move |socket| run_socket(socket, room, peer_id, outbox_rx))
}

/// Best-effort client address for the per-address cap.
///
/// Behind a proxy the first `x-forwarded-for` hop is the real client; a
/// direct connection falls back to the peer address.
fn client_addr(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| peer.map(|peer| peer.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn run_socket(
    socket: WebSocket,
    room: Arc<RelayRoom>,
    peer_id: Uuid,
    mut outbox_rx: mpsc::UnboundedReceiver<String>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Forward queued frames to the socket until the outbox closes.
    let sender_task = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Text(frame.into())).await {
                debug!(%peer_id, error = %e, "socket send failed");
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_frame(&room, peer_id, text.as_str()).await,
            Ok(Message::Close(_)) => {
                debug!(%peer_id, "socket closed by peer");
                break;
            }
            // Control frames are handled by the protocol layer.
            Ok(_) => {}
            Err(e) => {
                warn!(%peer_id, error = %e, "socket error");
                break;
            }
        }
    }

    room.disconnect(peer_id).await;
    sender_task.abort();
    info!(room = %room.name(), %peer_id, "signaling connection ended");
}

/// Interpret one inbound frame. Malformed frames are dropped; the peers
/// own the payload protocol, the relay only routes.
async fn handle_frame(room: &RelayRoom, peer_id: Uuid, raw: &str) {
    let message: SignalMessage = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(e) => {
            debug!(%peer_id, error = %e, "dropping malformed frame");
            return;
        }
    };

    match message {
        SignalMessage::Subscribe { topics } => room.subscribe(peer_id, topics).await,
        SignalMessage::Unsubscribe { topics } => room.unsubscribe(peer_id, topics).await,
        SignalMessage::Publish { topic } => {
            let delivered = room.publish(peer_id, &topic, raw).await;
            debug!(%peer_id, topic, delivered, "relayed publish");
        }
        SignalMessage::Ping => {
            room.send_to(peer_id, PONG_FRAME).await;
        }
        SignalMessage::Pong => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn forwarded(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn forwarded_header_wins_over_peer_address() {
        let peer = Some("192.168.1.9:55555".parse().unwrap());
        assert_eq!(
            client_addr(&forwarded("203.0.113.7, 10.0.0.1"), peer),
            "203.0.113.7"
        );
        assert_eq!(client_addr(&HeaderMap::new(), peer), "192.168.1.9");
        assert_eq!(client_addr(&HeaderMap::new(), None), "unknown");
        assert_eq!(client_addr(&forwarded(" , "), None), "unknown");
    }
}

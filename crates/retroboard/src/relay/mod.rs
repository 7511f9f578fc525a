//! Minimal websocket signaling relay.
//!
//! Peers in the same room exchange opaque JSON frames through topic
//! subscriptions; the relay never inspects payloads. One relay process
//! serves any number of rooms, keyed by the `room` query parameter.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

pub mod handler;
pub mod protocol;
pub mod room;

pub use handler::signal_handler;
pub use protocol::{SignalMessage, PONG_FRAME};
pub use room::{RelayRoom, RoomRegistry, MAX_CONNS_PER_ADDR};

/// Build the relay router: a health probe plus the catch-all signaling
/// endpoint, so existing deployments keep working whatever path their
/// clients dial.
pub fn router(registry: Arc<RoomRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(get(signal_handler))
        .with_state(registry)
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio::time::{timeout, Duration};
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use tower::ServiceExt;

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    #[tokio::test]
    async fn health_answers_without_an_upgrade() {
        let router = router(Arc::new(RoomRegistry::new()));
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn plain_http_gets_upgrade_required() {
        let router = router(Arc::new(RoomRegistry::new()));
        for uri in ["/", "/anything?room=retro"] {
            let response = router
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED, "uri {}", uri);
        }
    }

    async fn serve(registry: Arc<RoomRegistry>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(registry);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr, room: &str) -> Client {
        let (client, _response) = connect_async(format!("ws://{}/?room={}", addr, room))
            .await
            .unwrap();
        client
    }

    async fn send(client: &mut Client, frame: &str) {
        client.send(Message::Text(frame.to_string())).await.unwrap();
    }

    async fn recv_text(client: &mut Client) -> String {
        loop {
            let msg = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("socket error");
            if let Message::Text(text) = msg {
                return text;
            }
        }
    }

    /// Round-trip a ping so all previously sent frames are processed.
    async fn settle(client: &mut Client) {
        send(client, r#"{"type":"ping"}"#).await;
        assert_eq!(recv_text(client).await, PONG_FRAME);
    }

    #[tokio::test]
    async fn frames_reach_matching_subscribers_verbatim() {
        let addr = serve(Arc::new(RoomRegistry::new())).await;

        let mut alice = connect(addr, "retro").await;
        let mut bob = connect(addr, "retro").await;
        let mut carol = connect(addr, "retro").await;

        send(&mut alice, r#"{"type":"subscribe","topics":["board-1"]}"#).await;
        send(&mut bob, r#"{"type":"subscribe","topics":["board-2"]}"#).await;
        settle(&mut alice).await;
        settle(&mut bob).await;

        let frame = r#"{"type":"publish","topic":"board-1","data":{"sdp":"offer"}}"#;
        send(&mut carol, frame).await;

        assert_eq!(recv_text(&mut alice).await, frame);
        // Bob subscribed to a different topic and hears nothing.
        settle(&mut bob).await;
    }

    #[tokio::test]
    async fn rooms_are_isolated_end_to_end() {
        let addr = serve(Arc::new(RoomRegistry::new())).await;

        let mut red = connect(addr, "red").await;
        let mut blue = connect(addr, "blue").await;
        send(&mut red, r#"{"type":"subscribe","topics":["t"]}"#).await;
        send(&mut blue, r#"{"type":"subscribe","topics":["t"]}"#).await;
        settle(&mut red).await;
        settle(&mut blue).await;

        let mut publisher = connect(addr, "red").await;
        send(&mut publisher, r#"{"type":"publish","topic":"t","n":1}"#).await;

        assert_eq!(recv_text(&mut red).await, r#"{"type":"publish","topic":"t","n":1}"#);
        settle(&mut blue).await;
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_and_the_socket_lives_on() {
        let addr = serve(Arc::new(RoomRegistry::new())).await;

        let mut client = connect(addr, "retro").await;
        send(&mut client, "not json at all").await;
        send(&mut client, r#"{"type":"shout","topics":[]}"#).await;

        // Still responsive afterwards.
        settle(&mut client).await;
    }

    #[tokio::test]
    async fn per_address_cap_yields_429() {
        let addr = serve(Arc::new(RoomRegistry::with_limit(2))).await;

        let _first = connect(addr, "retro").await;
        let _second = connect(addr, "retro").await;

        let err = connect_async(format!("ws://{}/?room=retro", addr))
            .await
            .expect_err("third connection from one address must be refused");
        match err {
            WsError::Http(response) => {
                assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
            }
            other => panic!("expected HTTP rejection, got {:?}", other),
        }

        // The cap is per address and per room.
        let _elsewhere = connect(addr, "other-room").await;
    }

    #[tokio::test]
    async fn aborted_handshake_releases_the_address_slot() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let registry = Arc::new(RoomRegistry::with_limit(1));
        let addr = serve(registry.clone()).await;

        // Hand-rolled handshake so the connection can be torn down right
        // after admission, before any frame is exchanged.
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /?room=retro HTTP/1.1\r\n\
             Host: {}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        // The 101 means the slot was reserved.
        let mut buf = [0u8; 12];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 101");
        drop(stream);

        let room = registry.room("retro");
        for _ in 0..100 {
            if room.connections_from("127.0.0.1").await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(room.connections_from("127.0.0.1").await, 0);
        assert_eq!(room.socket_count().await, 0);

        // The address is usable again.
        let mut client = connect(addr, "retro").await;
        settle(&mut client).await;
    }

    #[tokio::test]
    async fn disconnect_releases_the_address_slot() {
        let registry = Arc::new(RoomRegistry::with_limit(1));
        let addr = serve(registry.clone()).await;

        let mut first = connect(addr, "retro").await;
        settle(&mut first).await;
        first.close(None).await.unwrap();

        // Wait for the server side to process the close.
        let room = registry.room("retro");
        for _ in 0..100 {
            if room.socket_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(room.socket_count().await, 0);

        let mut second = connect(addr, "retro").await;
        settle(&mut second).await;
    }
}

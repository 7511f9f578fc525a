use serde::{Deserialize, Serialize};

/// A signaling frame, as far as the relay needs to understand it.
///
/// Frames are JSON text. Publish frames carry arbitrary additional payload
/// fields that peers interpret; the relay only reads the routing envelope
/// and forwards the raw frame verbatim, so unknown fields survive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
    Publish {
        topic: String,
    },
    Ping,
    Pong,
}

/// Canonical keepalive reply frame.
pub const PONG_FRAME: &str = r#"{"type":"pong"}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_envelope_parses() {
        let msg: SignalMessage =
            serde_json::from_str(r#"{"type":"subscribe","topics":["room-a","room-b"]}"#).unwrap();
        assert_eq!(
            msg,
            SignalMessage::Subscribe {
                topics: vec!["room-a".to_string(), "room-b".to_string()]
            }
        );

        let msg: SignalMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, SignalMessage::Ping);
    }

    #[test]
    fn publish_payload_fields_are_ignored_by_the_envelope() {
        let msg: SignalMessage = serde_json::from_str(
            r#"{"type":"publish","topic":"room-a","data":{"signal":"offer"},"from":"peer-1"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SignalMessage::Publish {
                topic: "room-a".to_string()
            }
        );
    }

    #[test]
    fn missing_topics_default_to_empty() {
        let msg: SignalMessage = serde_json::from_str(r#"{"type":"subscribe"}"#).unwrap();
        assert_eq!(msg, SignalMessage::Subscribe { topics: vec![] });
    }

    #[test]
    fn unknown_or_malformed_frames_fail_to_parse() {
        assert!(serde_json::from_str::<SignalMessage>(r#"{"type":"shout"}"#).is_err());
        assert!(serde_json::from_str::<SignalMessage>(r#"{"type":"publish"}"#).is_err());
        assert!(serde_json::from_str::<SignalMessage>("not json").is_err());
    }

    #[test]
    fn pong_frame_is_a_valid_pong() {
        let msg: SignalMessage = serde_json::from_str(PONG_FRAME).unwrap();
        assert_eq!(msg, SignalMessage::Pong);
    }
}

//! Frames exchanged between a peer and the rendezvous relay.
//!
//! Every frame is one JSON text message tagged by `type`. The relay is the
//! only party that reads the room field; [`SignalingMessage`] payloads are
//! forwarded untouched.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::signaling::SignalingMessage;

/// Opaque room identifier shared out of band by the two participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Frames sent by a peer to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Join `room`, creating it if empty.
    CreateOrJoin { room: RoomId },
    /// Relay `payload` to the other participant of `room`.
    Publish {
        room: RoomId,
        payload: SignalingMessage,
    },
    /// Leave `room`.
    Leave { room: RoomId },
}

/// Frames sent by the relay to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    /// The caller is the first participant of the room.
    Created {
        room: RoomId,
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// The caller entered a room that already had a participant.
    Joined {
        room: RoomId,
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// Both participants are present.
    Ready { room: RoomId },
    /// The room already holds two participants.
    Full { room: RoomId },
    /// Signaling payload from the other participant.
    Message {
        room: RoomId,
        payload: SignalingMessage,
    },
    /// The other participant disconnected or left.
    PeerLeft { room: RoomId },
    /// The relay rejected a frame.
    Error { message: String },
}

impl ServerFrame {
    /// Room the frame refers to, if any.
    pub fn room(&self) -> Option<&RoomId> {
        match self {
            Self::Created { room, .. }
            | Self::Joined { room, .. }
            | Self::Ready { room }
            | Self::Full { room }
            | Self::Message { room, .. }
            | Self::PeerLeft { room } => Some(room),
            Self::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SessionDescription;

    #[test]
    fn create_or_join_wire_shape() {
        let frame = ClientFrame::CreateOrJoin {
            room: RoomId::new("a1b2"),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "createOrJoin", "room": "a1b2"})
        );
    }

    #[test]
    fn publish_nests_signaling_payload() {
        let frame = ClientFrame::Publish {
            room: RoomId::new("r"),
            payload: SignalingMessage::Answer(SessionDescription::new("sdp")),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "publish");
        assert_eq!(json["payload"]["type"], "answer");
        assert_eq!(json["payload"]["sdp"], "sdp");
    }

    #[test]
    fn created_uses_peer_id_field() {
        let json = r#"{"type":"created","room":"r","peerId":"p-1"}"#;
        let frame: ServerFrame = serde_json::from_str(json).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Created {
                room: RoomId::new("r"),
                peer_id: "p-1".into()
            }
        );
    }

    #[test]
    fn peer_left_tag() {
        let frame = ServerFrame::PeerLeft {
            room: RoomId::new("r"),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"peerLeft""#));
    }

    #[test]
    fn error_frame_has_no_room() {
        let frame = ServerFrame::Error {
            message: "bad frame".into(),
        };
        assert!(frame.room().is_none());
        let ready = ServerFrame::Ready {
            room: RoomId::new("x"),
        };
        assert_eq!(ready.room().map(RoomId::as_str), Some("x"));
    }

    #[test]
    fn room_id_is_transparent() {
        let json = serde_json::to_string(&RoomId::new("abc")).unwrap();
        assert_eq!(json, r#""abc""#);
        assert_eq!(RoomId::from("abc").to_string(), "abc");
    }
}

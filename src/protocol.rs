//! Relay Protocol
//!
//! Defines the JSON frame format exchanged over the WebSocket endpoint:
//! one object per text frame, dispatched on its `type` tag. Inbound and
//! outbound frames are separate closed sets so the router matches over
//! exactly what clients may send.
//!
//! Field casing (camelCase) and type tags (kebab-case) are fixed by the
//! deployed client and must not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One of the two fixed roles in a room.
///
/// The set is closed: a join carrying any other `userType` fails to decode,
/// so a room can never hold a third identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Identity {
    Admin,
    Friend,
}

impl Identity {
    /// The other side of the room.
    pub fn opposite(self) -> Self {
        match self {
            Identity::Admin => Identity::Friend,
            Identity::Friend => Identity::Admin,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Identity::Admin => "admin",
            Identity::Friend => "friend",
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display profile a client attaches at join time and may overwrite later.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
}

/// Payload kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

/// Delivery state of a chat message as reported back to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

/// A chat message as it travels through the relay.
///
/// `id` is a caller-supplied idempotency key; the relay never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sender_name: String,
}

/// Marks a relayed chat copy as the receiving device's own outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderTag {
    Me,
}

/// Frames accepted from clients.
///
/// Every frame carries a `roomId` envelope field on the wire; only `join`
/// reads it — after the handshake the connection's room is fixed, so the
/// field is ignored elsewhere. SDP and ICE payloads stay opaque `Value`s:
/// the relay forwards them without interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Join {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userType")]
        user_type: Identity,
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(default)]
        profile: Profile,
    },
    ChatMessage(ChatMessage),
    Typing {
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    ProfileUpdate {
        profile: Profile,
    },
    MessageRead {
        ids: Vec<String>,
    },
    SyncResponse {
        #[serde(rename = "targetDeviceId")]
        target_device_id: String,
        messages: Value,
    },
    Offer {
        sdp: Value,
    },
    Answer {
        sdp: Value,
    },
    IceCandidate {
        candidate: Value,
    },
    CallRequest {
        #[serde(rename = "callType")]
        call_type: String,
        #[serde(default)]
        from: String,
    },
    CallAccepted {
        #[serde(rename = "callType")]
        call_type: String,
    },
    CallRejected,
    CallEnd,
    EmergencyWipe,
}

/// Frames emitted by the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Joined {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "isInitiator")]
        is_initiator: bool,
        #[serde(rename = "peerCount")]
        peer_count: usize,
        #[serde(rename = "peerProfile", skip_serializing_if = "Option::is_none")]
        peer_profile: Option<Profile>,
        #[serde(rename = "peerOnline")]
        peer_online: bool,
    },
    PeerJoined {
        profile: Profile,
    },
    PeerLeft,
    SyncRequest {
        #[serde(rename = "targetDeviceId")]
        target_device_id: String,
    },
    SyncMessages {
        messages: Value,
    },
    MessageQueued {
        id: String,
        status: DeliveryStatus,
    },
    MessageStatus {
        ids: Vec<String>,
        status: DeliveryStatus,
    },
    ChatMessage {
        #[serde(flatten)]
        message: ChatMessage,
        status: DeliveryStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<SenderTag>,
    },
    Typing {
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    ProfileUpdate {
        profile: Profile,
    },
    Offer {
        sdp: Value,
    },
    Answer {
        sdp: Value,
    },
    IceCandidate {
        candidate: Value,
    },
    CallRequest {
        #[serde(rename = "callType")]
        call_type: String,
        from: String,
    },
    CallAccepted {
        #[serde(rename = "callType")]
        call_type: String,
    },
    CallRejected,
    CallEnd,
    EmergencyWipe,
}

impl ClientFrame {
    /// Decode a frame from WebSocket text.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ServerFrame {
    /// Encode the frame as WebSocket text.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join() {
        let text = r#"{"type":"join","roomId":"SECURE_CHAT_MAIN","userType":"admin","deviceId":"dev-1","profile":{"name":"Admin","avatar":""}}"#;
        let frame = ClientFrame::from_text(text).unwrap();

        if let ClientFrame::Join {
            room_id,
            user_type,
            device_id,
            profile,
        } = frame
        {
            assert_eq!(room_id, "SECURE_CHAT_MAIN");
            assert_eq!(user_type, Identity::Admin);
            assert_eq!(device_id, "dev-1");
            assert_eq!(profile.name, "Admin");
        } else {
            panic!("Wrong frame type");
        }
    }

    #[test]
    fn test_parse_chat_message_with_envelope_field() {
        // Clients stamp every frame with roomId; non-join frames ignore it.
        let text = r#"{"type":"chat-message","roomId":"r1","id":"m1","text":"hello","timestamp":"2024-05-01T12:00:00Z","senderName":"Admin"}"#;
        let frame = ClientFrame::from_text(text).unwrap();

        if let ClientFrame::ChatMessage(message) = frame {
            assert_eq!(message.id, "m1");
            assert_eq!(message.text, "hello");
            assert_eq!(message.message_type, MessageKind::Text);
            assert!(message.media_url.is_none());
        } else {
            panic!("Wrong frame type");
        }
    }

    #[test]
    fn test_parse_unit_frame_with_envelope_field() {
        let frame = ClientFrame::from_text(r#"{"type":"emergency-wipe","roomId":"r1"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::EmergencyWipe));
    }

    #[test]
    fn test_unknown_identity_rejected() {
        let text = r#"{"type":"join","roomId":"r1","userType":"stranger","deviceId":"d","profile":{}}"#;
        assert!(ClientFrame::from_text(text).is_err());
    }

    #[test]
    fn test_serialize_joined_omits_absent_peer_profile() {
        let frame = ServerFrame::Joined {
            room_id: "r1".to_string(),
            is_initiator: true,
            peer_count: 1,
            peer_profile: None,
            peer_online: false,
        };
        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();

        assert_eq!(value["type"], "joined");
        assert_eq!(value["isInitiator"], true);
        assert!(value.get("peerProfile").is_none());
    }

    #[test]
    fn test_serialize_sibling_chat_copy() {
        let frame = ServerFrame::ChatMessage {
            message: ChatMessage {
                id: "m1".to_string(),
                text: "hello".to_string(),
                message_type: MessageKind::Text,
                media_url: None,
                timestamp: "2024-05-01T12:00:00Z".parse().unwrap(),
                sender_name: "Admin".to_string(),
            },
            status: DeliveryStatus::Sent,
            sender: Some(SenderTag::Me),
        };
        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();

        assert_eq!(value["type"], "chat-message");
        assert_eq!(value["id"], "m1");
        assert_eq!(value["status"], "sent");
        assert_eq!(value["sender"], "me");
    }

    #[test]
    fn test_relay_preserves_opaque_sdp() {
        let text = r#"{"type":"offer","roomId":"r1","sdp":{"type":"offer","sdp":"v=0..."}}"#;
        let frame = ClientFrame::from_text(text).unwrap();

        if let ClientFrame::Offer { sdp } = frame {
            assert_eq!(sdp, json!({"type": "offer", "sdp": "v=0..."}));
        } else {
            panic!("Wrong frame type");
        }
    }
}

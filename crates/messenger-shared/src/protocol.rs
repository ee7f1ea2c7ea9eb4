use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::MachineId;

/// All events exchanged over a session, in either direction.
///
/// Encoded as one JSON object per WebSocket text frame:
/// `{"event": "join-room", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum WireEvent {
    JoinRoom(JoinRoom),
    UserJoined(PeerPresence),
    UserLeft(PeerPresence),
    SendMessage(ChatPayload),
    MessageReceived(ChatPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub username: String,
    pub machine_id: MachineId,
}

/// Presence announcement for user-joined and user-left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPresence {
    pub username: String,
    pub machine_id: MachineId,
    pub socket_id: String,
}

/// Chat line for send-message and message-received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub text: String,
    #[serde(default)]
    pub username: String,
    /// Unix epoch millis; senders that omit it get the arrival time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<MachineId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_socket_id: Option<String>,
}

impl WireEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WireEvent::JoinRoom(_) => "join-room",
            WireEvent::UserJoined(_) => "user-joined",
            WireEvent::UserLeft(_) => "user-left",
            WireEvent::SendMessage(_) => "send-message",
            WireEvent::MessageReceived(_) => "message-received",
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a JSON text frame
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_matches_event_table() {
        let event = WireEvent::JoinRoom(JoinRoom {
            username: "alice".into(),
            machine_id: MachineId::from("m-a"),
        });
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "join-room");
        assert_eq!(value["data"]["username"], "alice");
        assert_eq!(value["data"]["machineId"], "m-a");
    }

    #[test]
    fn test_decode_message_without_optional_fields() {
        let raw = r#"{"event":"send-message","data":{"text":"hi","username":"bob"}}"#;
        match WireEvent::from_json(raw).unwrap() {
            WireEvent::SendMessage(chat) => {
                assert_eq!(chat.text, "hi");
                assert_eq!(chat.timestamp, None);
                assert_eq!(chat.sender_id, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let raw = r#"{"event":"typing","data":{}}"#;
        assert!(matches!(
            WireEvent::from_json(raw),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(WireEvent::from_json("not json").is_err());
    }
}

//! Defines the JSON frame protocol spoken over the room WebSocket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use voxroom_core::types::{ChatRecord, ChatSender};

/// Frames sent from the client to the room.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Publishes (`muted: false`) or unpublishes the local audio track.
    PublishTrack { muted: bool },
    /// A block of local audio (base64 PCM16 LE, mono, room rate).
    Audio { data: String },
    /// A chat record on the data channel.
    Chat {
        sender: ChatSender,
        text: String,
        #[serde(rename = "sentAt")]
        sent_at: DateTime<Utc>,
    },
    /// Leaves the room.
    Leave,
}

/// Frames sent from the room to the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Confirms the credential and completes negotiation. Always first.
    Joined { room: String, identity: String },
    ParticipantJoined {
        identity: String,
        #[serde(default)]
        agent: bool,
    },
    ParticipantLeft { identity: String },
    /// A block of a remote participant's audio.
    Audio { participant: String, data: String },
    Chat {
        sender: ChatSender,
        text: String,
        #[serde(rename = "sentAt")]
        sent_at: DateTime<Utc>,
    },
    /// Fatal before `joined`, informational afterwards.
    Error { message: String },
    /// The room ended the session.
    Leave {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl From<ChatRecord> for ClientFrame {
    fn from(record: ChatRecord) -> Self {
        ClientFrame::Chat {
            sender: record.sender,
            text: record.text,
            sent_at: record.sent_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frames_wire_shape() {
        let frame = ClientFrame::PublishTrack { muted: false };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "type": "publish_track", "muted": false })
        );
        assert_eq!(
            serde_json::to_value(ClientFrame::Leave).unwrap(),
            json!({ "type": "leave" })
        );

        let sent_at = DateTime::parse_from_rfc3339("2025-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let frame = ClientFrame::from(ChatRecord {
            sender: ChatSender::User,
            text: "hello".into(),
            sent_at,
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "chat");
        assert_eq!(value["sender"], "user");
        assert_eq!(value["sentAt"], "2025-01-01T12:00:00Z");
    }

    #[test]
    fn test_server_frames_parse() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"participant_joined","identity":"agent-7","agent":true}"#)
                .unwrap();
        assert_eq!(
            frame,
            ServerFrame::ParticipantJoined {
                identity: "agent-7".into(),
                agent: true
            }
        );

        // Test with the agent flag omitted
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"participant_joined","identity":"bob"}"#).unwrap();
        assert!(matches!(frame, ServerFrame::ParticipantJoined { agent: false, .. }));

        let frame: ServerFrame = serde_json::from_str(
            r#"{"type":"chat","sender":"agent","text":"Hi there","sentAt":"2025-01-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(frame, ServerFrame::Chat { sender: ChatSender::Agent, .. }));

        let frame: ServerFrame = serde_json::from_str(r#"{"type":"leave"}"#).unwrap();
        assert_eq!(frame, ServerFrame::Leave { reason: None });

        assert!(serde_json::from_str::<ServerFrame>(r#"{"type":"dance"}"#).is_err());
    }
}

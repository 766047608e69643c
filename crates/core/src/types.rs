//! Domain types shared by the controller, its collaborators and observers.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A short-lived credential for joining one session.
///
/// Single-use: it is consumed by the transport and never cached.
#[derive(Debug)]
pub struct SessionCredential {
    pub token: SecretString,
    pub transport_url: String,
}

impl SessionCredential {
    pub fn new(token: impl Into<String>, transport_url: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            transport_url: transport_url.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatSender {
    User,
    Agent,
}

/// A chat message as it travels over the session's data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub sender: ChatSender,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// A chat message as displayed. Once appended to the history it never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: ChatSender,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    /// A message authored by the local participant, stamped now.
    pub fn local(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: ChatSender::User,
            text: text.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn from_record(record: ChatRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: record.sender,
            text: record.text,
            sent_at: record.sent_at,
        }
    }

    pub fn to_record(&self) -> ChatRecord {
        ChatRecord {
            sender: self.sender,
            text: self.text.clone(),
            sent_at: self.sent_at,
        }
    }
}

/// A block of mono PCM samples normalised to `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }
}

/// Everything the presentation layer may read, captured atomically.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub connection_status: ConnectionStatus,
    pub is_speaking: bool,
    /// Local microphone level, 0-100.
    pub audio_level: u8,
    /// Remote agent level, 0-100.
    pub agent_audio_level: u8,
    pub agent_present: bool,
    /// Playback volume, 0-100.
    pub volume: f32,
    pub chat_messages: Vec<ChatMessage>,
    pub error: Option<String>,
}

impl SessionSnapshot {
    pub fn new(volume: f32) -> Self {
        Self {
            connection_status: ConnectionStatus::Disconnected,
            is_speaking: false,
            audio_level: 0,
            agent_audio_level: 0,
            agent_present: false,
            volume,
            chat_messages: Vec::new(),
            error: None,
        }
    }
}

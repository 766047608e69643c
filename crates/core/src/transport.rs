//! The seam between the session controller and a concrete media transport.

use crate::{
    error::SessionError,
    types::{AudioFrame, ChatRecord, SessionCredential},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Asynchronous notifications raised by an open transport session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A remote participant entered the room.
    ParticipantJoined { identity: String, is_agent: bool },
    /// A remote participant left the room.
    ParticipantLeft { identity: String, is_agent: bool },
    /// A chat record arrived over the data channel.
    ChatReceived(ChatRecord),
    /// The session ended without the controller asking for it.
    Disconnected { reason: String },
}

/// An open, authenticated session.
///
/// Dropping the last reference must release the underlying connection, so an
/// attempt abandoned mid-negotiation never leaves a session alive.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Announces whether the local audio track is published.
    async fn set_track_published(&self, published: bool) -> Result<(), SessionError>;

    /// Sends one block of local microphone audio on the published track.
    async fn publish_audio(&self, frame: AudioFrame) -> Result<(), SessionError>;

    /// Hands a chat record to the data channel.
    async fn send_chat(&self, record: ChatRecord) -> Result<(), SessionError>;

    /// Sets the gain (0.0-1.0) applied to remote audio playback.
    fn set_playback_volume(&self, gain: f32);

    /// Leaves the room and releases the connection. Idempotent.
    async fn close(&self);
}

/// Everything produced by a successful negotiation.
pub struct TransportLink {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::Receiver<TransportEvent>,
    /// Inbound audio of the agent participant.
    pub remote_audio: mpsc::Receiver<AudioFrame>,
}

/// Opens sessions against a transport URL.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Negotiates a session using a single-use credential.
    async fn connect(&self, credential: SessionCredential) -> Result<TransportLink, SessionError>;
}

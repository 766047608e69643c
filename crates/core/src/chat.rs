//! The text-chat side channel multiplexed on the transport session.

use crate::{
    error::SessionError,
    transport::TransportSession,
    types::{ChatMessage, ChatRecord, ChatSender},
};
use std::sync::Arc;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, warn};

const OUTBOUND_CAPACITY: usize = 64;

/// Invoked when an outbound record could not be delivered.
pub type ChatFailureCallback = Arc<dyn Fn(SessionError) + Send + Sync>;

/// Outbound half of the chat channel.
///
/// Records are written by a single task, so they leave in the order `send`
/// accepted them. `send` never waits for delivery.
pub struct ChatChannel {
    outbound: mpsc::Sender<ChatRecord>,
    writer: Option<JoinHandle<()>>,
}

impl ChatChannel {
    pub fn open(transport: Arc<dyn TransportSession>, on_failure: ChatFailureCallback) -> Self {
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        Self {
            outbound,
            writer: Some(tokio::spawn(write_records(rx, transport, on_failure))),
        }
    }

    /// Queues a record for delivery.
    pub fn send(&self, record: ChatRecord) -> Result<(), SessionError> {
        self.outbound.try_send(record).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::Channel("outbound queue is full".to_string()),
            TrySendError::Closed(_) => SessionError::Channel("channel is not open".to_string()),
        })
    }

    /// Stops the writer. Records still queued are discarded.
    pub async fn close(mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
            let _ = writer.await;
        }
        debug!("Chat channel closed");
    }
}

impl Drop for ChatChannel {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

async fn write_records(
    mut rx: mpsc::Receiver<ChatRecord>,
    transport: Arc<dyn TransportSession>,
    on_failure: ChatFailureCallback,
) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = transport.send_chat(record).await {
            warn!(error = %e, "Chat send failed");
            on_failure(e);
        }
    }
}

/// Converts an inbound record into a displayable message.
///
/// Echoes of locally authored messages are dropped: the local copy was
/// already appended when it was sent.
pub fn inbound_message(record: ChatRecord) -> Option<ChatMessage> {
    match record.sender {
        ChatSender::Agent => Some(ChatMessage::from_record(record)),
        ChatSender::User => {
            debug!("Ignoring echoed user chat record");
            None
        }
    }
}

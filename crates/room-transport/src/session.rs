//! Opens and drives one WebSocket session per room connection.

use crate::{
    audio::{self, ROOM_SAMPLE_RATE},
    protocol::{ClientFrame, ServerFrame},
};
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use secrecy::ExposeSecret;
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message},
};
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};
use voxroom_core::{
    error::SessionError,
    transport::{Transport, TransportEvent, TransportLink, TransportSession},
    types::{AudioFrame, ChatRecord, SessionCredential},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const OUTBOUND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;
const REMOTE_AUDIO_CAPACITY: usize = 64;
const PLAYBACK_CAPACITY: usize = 64;

/// Connects to rooms over WebSocket.
///
/// Agent audio of every session is also republished, scaled by the session's
/// playback volume, on a feed shared by all sessions of this transport.
pub struct WsTransport {
    playback: broadcast::Sender<AudioFrame>,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WsTransport {
    pub fn new() -> Self {
        let (playback, _) = broadcast::channel(PLAYBACK_CAPACITY);
        Self { playback }
    }

    /// Volume-scaled agent audio, ready for an output device.
    pub fn playback(&self) -> broadcast::Receiver<AudioFrame> {
        self.playback.subscribe()
    }
}

#[async_trait]
impl Transport for WsTransport {
    #[instrument(name = "room_connect", skip_all, fields(url = %credential.transport_url))]
    async fn connect(&self, credential: SessionCredential) -> Result<TransportLink, SessionError> {
        let mut request = credential
            .transport_url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Transport(format!("invalid room url: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token.expose_secret()))
            .map_err(|e| SessionError::Transport(format!("invalid credential: {}", e)))?;
        request.headers_mut().insert("Authorization", bearer);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| SessionError::Transport(format!("failed to open room socket: {}", e)))?;
        let (sink, mut stream) = ws_stream.split();

        let (room, identity) = await_joined(&mut stream).await?;
        info!(%room, %identity, "Joined room");

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events) = mpsc::channel(EVENT_CAPACITY);
        let (audio_tx, remote_audio) = mpsc::channel(REMOTE_AUDIO_CAPACITY);
        let gain = Arc::new(AtomicU32::new(1.0f32.to_bits()));

        let span = info_span!("room_session", %room, %identity);
        let writer = tokio::spawn(write_frames(sink, outbound_rx).instrument(span.clone()));
        let reader = tokio::spawn(
            read_frames(
                stream,
                events_tx,
                audio_tx,
                self.playback.clone(),
                gain.clone(),
            )
            .instrument(span),
        );

        let session = WsTransportSession {
            room,
            outbound,
            gain,
            closed: AtomicBool::new(false),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        };
        Ok(TransportLink {
            session: Arc::new(session),
            events,
            remote_audio,
        })
    }
}

/// One joined room. Dropping it aborts the socket tasks.
pub struct WsTransportSession {
    room: String,
    outbound: mpsc::Sender<ClientFrame>,
    gain: Arc<AtomicU32>,
    closed: AtomicBool,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransportSession {
    async fn enqueue(&self, frame: ClientFrame) -> Result<(), ClientFrame> {
        if self.closed.load(Ordering::Acquire) {
            return Err(frame);
        }
        self.outbound.send(frame).await.map_err(|e| e.0)
    }
}

#[async_trait]
impl TransportSession for WsTransportSession {
    async fn set_track_published(&self, published: bool) -> Result<(), SessionError> {
        self.enqueue(ClientFrame::PublishTrack { muted: !published })
            .await
            .map_err(|_| SessionError::Transport("session is closed".to_string()))
    }

    async fn publish_audio(&self, frame: AudioFrame) -> Result<(), SessionError> {
        if frame.sample_rate != ROOM_SAMPLE_RATE {
            return Err(SessionError::Transport(format!(
                "expected {} Hz audio, got {} Hz",
                ROOM_SAMPLE_RATE, frame.sample_rate
            )));
        }
        let data = audio::encode_pcm16(&frame.samples);
        self.enqueue(ClientFrame::Audio { data })
            .await
            .map_err(|_| SessionError::Transport("session is closed".to_string()))
    }

    async fn send_chat(&self, record: ChatRecord) -> Result<(), SessionError> {
        self.enqueue(ClientFrame::from(record))
            .await
            .map_err(|_| SessionError::Channel("data channel is closed".to_string()))
    }

    fn set_playback_volume(&self, gain: f32) {
        let gain = if gain.is_finite() { gain.clamp(0.0, 1.0) } else { 1.0 };
        self.gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reader) = take_task(&self.reader) {
            reader.abort();
        }
        // The writer flushes the leave frame and closes the socket.
        let _ = self.outbound.send(ClientFrame::Leave).await;
        if let Some(writer) = take_task(&self.writer) {
            let _ = writer.await;
        }
        info!(room = %self.room, "Left room");
    }
}

impl Drop for WsTransportSession {
    fn drop(&mut self) {
        for slot in [&self.reader, &self.writer] {
            if let Some(task) = take_task(slot) {
                task.abort();
            }
        }
    }
}

fn take_task(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    slot.lock().ok()?.take()
}

async fn await_joined(stream: &mut WsSource) -> Result<(String, String), SessionError> {
    while let Some(message) = stream.next().await {
        let message = message.map_err(|e| {
            SessionError::Transport(format!("room socket failed during negotiation: {}", e))
        })?;
        match message {
            Message::Text(text) => {
                return match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Joined { room, identity }) => Ok((room, identity)),
                    Ok(ServerFrame::Error { message }) => Err(SessionError::Transport(format!(
                        "room rejected the session: {}",
                        message
                    ))),
                    Ok(_) => Err(SessionError::Transport(
                        "room did not confirm the join".to_string(),
                    )),
                    Err(e) => Err(SessionError::Transport(format!(
                        "malformed room frame: {}",
                        e
                    ))),
                };
            }
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(SessionError::Transport(
        "room closed the socket during negotiation".to_string(),
    ))
}

async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> anyhow::Result<()> {
    let serialized = serde_json::to_string(frame)?;
    sink.send(Message::Text(serialized.into())).await?;
    Ok(())
}

async fn write_frames(mut sink: WsSink, mut rx: mpsc::Receiver<ClientFrame>) {
    while let Some(frame) = rx.recv().await {
        let leaving = frame == ClientFrame::Leave;
        if let Err(e) = send_frame(&mut sink, &frame).await {
            warn!(error = %e, "Failed to write room frame");
            break;
        }
        if leaving {
            break;
        }
    }
    let _ = sink.close().await;
    debug!("Room writer stopped");
}

async fn read_frames(
    mut stream: WsSource,
    events: mpsc::Sender<TransportEvent>,
    remote_audio: mpsc::Sender<AudioFrame>,
    playback: broadcast::Sender<AudioFrame>,
    gain: Arc<AtomicU32>,
) {
    let mut agents = HashSet::new();

    let reason = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| f.reason.to_string())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "room closed the socket".to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break format!("room socket failed: {}", e),
            None => break "room socket closed".to_string(),
        };

        let frame = match serde_json::from_str::<ServerFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Ignoring unrecognised room frame");
                continue;
            }
        };

        let event = match frame {
            ServerFrame::Joined { .. } => {
                debug!("Ignoring repeated joined frame");
                continue;
            }
            ServerFrame::ParticipantJoined { identity, agent } => {
                if agent {
                    agents.insert(identity.clone());
                }
                TransportEvent::ParticipantJoined {
                    identity,
                    is_agent: agent,
                }
            }
            ServerFrame::ParticipantLeft { identity } => {
                let is_agent = agents.remove(&identity);
                TransportEvent::ParticipantLeft { identity, is_agent }
            }
            ServerFrame::Audio { participant, data } => {
                if !agents.contains(&participant) {
                    trace!(%participant, "Skipping audio of a non-agent participant");
                    continue;
                }
                let samples = match audio::decode_pcm16(&data) {
                    Ok(samples) if !samples.is_empty() => samples,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, %participant, "Dropping undecodable audio frame");
                        continue;
                    }
                };
                if playback.receiver_count() > 0 {
                    let gain = f32::from_bits(gain.load(Ordering::Relaxed));
                    let _ = playback.send(AudioFrame::new(
                        audio::apply_gain(&samples, gain),
                        ROOM_SAMPLE_RATE,
                    ));
                }
                if remote_audio
                    .try_send(AudioFrame::new(samples, ROOM_SAMPLE_RATE))
                    .is_err()
                {
                    trace!("Remote audio consumer lagging, dropping frame");
                }
                continue;
            }
            ServerFrame::Chat {
                sender,
                text,
                sent_at,
            } => TransportEvent::ChatReceived(ChatRecord {
                sender,
                text,
                sent_at,
            }),
            ServerFrame::Error { message } => {
                warn!(%message, "Room reported an error");
                continue;
            }
            ServerFrame::Leave { reason } => {
                break reason.unwrap_or_else(|| "room ended the session".to_string());
            }
        };

        if events.send(event).await.is_err() {
            debug!("Event consumer gone, stopping room reader");
            return;
        }
    };

    info!(%reason, "Room session ended");
    let _ = events.send(TransportEvent::Disconnected { reason }).await;
}

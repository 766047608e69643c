//! Session Controller
//!
//! Owns the connection state machine and every resource of the active session.
//! All commands and collaborator callbacks are funnelled through one queue and
//! applied one at a time by a single runtime task, so observers only ever see
//! complete states. The presentation layer holds a cloneable
//! `SessionController` handle: commands return immediately and their effects
//! surface through `snapshot`, `subscribe` and `subscribe_transitions`.

use crate::{
    capture::{CaptureUnit, Microphone, MicrophoneStream, StreamEndedCallback},
    chat::{self, ChatChannel},
    credential::CredentialFetcher,
    error::SessionError,
    level::{DEFAULT_LEVEL_INTERVAL, LevelCallback},
    monitor::RemoteAudioMonitor,
    transport::{Transport, TransportEvent, TransportLink, TransportSession},
    types::{ChatMessage, ConnectionStatus, SessionSnapshot},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::{JoinError, JoinHandle},
};
use tracing::{Instrument, debug, error, info, info_span, warn};

pub const DEFAULT_VOLUME: f32 = 80.0;
const TRANSITION_CAPACITY: usize = 32;

/// Tunables of a `SessionController`.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Upper bound on one connection attempt, and on a microphone request
    /// made while connected.
    pub connect_timeout: Duration,
    /// How long teardown waits for the transport to close.
    pub close_timeout: Duration,
    /// Cadence of level callbacks.
    pub level_interval: Duration,
    /// Playback volume before any `set_volume` call, 0-100.
    pub initial_volume: f32,
    /// Whether the microphone is published as soon as a session connects.
    pub speak_on_connect: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            close_timeout: Duration::from_secs(2),
            level_interval: DEFAULT_LEVEL_INTERVAL,
            initial_volume: DEFAULT_VOLUME,
            speak_on_connect: false,
        }
    }
}

/// Clamps a requested volume to 0-100. Non-finite requests are rejected.
pub fn clamp_volume(percent: f32) -> Option<f32> {
    percent.is_finite().then(|| percent.clamp(0.0, 100.0))
}

/// Handle to a running session controller.
///
/// Must be created inside a tokio runtime. The runtime task shuts down, and
/// releases any live session, when the last clone is dropped.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Handle>,
}

struct Handle {
    ops: mpsc::UnboundedSender<Op>,
    snapshot: watch::Receiver<SessionSnapshot>,
    transitions: broadcast::Sender<ConnectionStatus>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        let _ = self.ops.send(Op::Shutdown);
    }
}

impl SessionController {
    pub fn new(
        config: ControllerConfig,
        fetcher: Arc<dyn CredentialFetcher>,
        transport: Arc<dyn Transport>,
        microphone: Arc<dyn Microphone>,
    ) -> Self {
        let volume = clamp_volume(config.initial_volume).unwrap_or(DEFAULT_VOLUME);
        let state = SessionSnapshot::new(volume);
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);

        let runtime = Runtime {
            speak_preference: config.speak_on_connect,
            config,
            fetcher,
            transport,
            microphone,
            ops: ops_tx.clone(),
            state,
            published: snapshot_tx,
            transitions: transitions.clone(),
            generation: 0,
            pending: None,
            live: None,
        };
        tokio::spawn(
            runtime
                .run(ops_rx)
                .instrument(info_span!("session_controller")),
        );

        Self {
            inner: Arc::new(Handle {
                ops: ops_tx,
                snapshot: snapshot_rx,
                transitions,
            }),
        }
    }

    /// Starts a connection attempt. Ignored unless disconnected.
    pub fn connect(&self) {
        self.submit(Op::Connect);
    }

    /// Ends the session or aborts the attempt in flight. Idempotent.
    pub fn disconnect(&self) {
        self.submit(Op::Disconnect);
    }

    /// Flips whether the microphone is published. Ignored unless connected.
    pub fn toggle_speaking(&self) {
        self.submit(Op::ToggleSpeaking);
    }

    /// Sets remote playback volume (0-100, clamped). Accepted in any state.
    pub fn set_volume(&self, percent: f32) {
        self.submit(Op::SetVolume(percent));
    }

    /// Sends a chat message. Ignored unless connected.
    pub fn send_chat_message(&self, text: impl Into<String>) {
        self.submit(Op::SendChat(text.into()));
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.snapshot.borrow().connection_status
    }

    /// Notified after every applied mutation.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.clone()
    }

    /// Every status transition, in order.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.inner.transitions.subscribe()
    }

    /// Waits until the published state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Option<SessionSnapshot> {
        let mut rx = self.subscribe();
        let snapshot = rx.wait_for(predicate).await.ok()?;
        Some(snapshot.clone())
    }

    fn submit(&self, op: Op) {
        if self.inner.ops.send(op).is_err() {
            warn!("Session controller is no longer running");
        }
    }
}

enum Op {
    Connect,
    Disconnect,
    ToggleSpeaking,
    SetVolume(f32),
    SendChat(String),
    Completed {
        generation: u64,
        result: Result<Completion, JoinError>,
    },
    LocalLevel {
        generation: u64,
        level: u8,
    },
    AgentLevel {
        generation: u64,
        level: u8,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    ChatFailed {
        generation: u64,
        error: SessionError,
    },
    CaptureLost {
        generation: u64,
        attachment: u64,
    },
    Shutdown,
}

/// Output of a background task the runtime is waiting on.
enum Completion {
    Connect(Result<Established, SessionError>),
    Microphone(Result<MicrophoneStream, SessionError>),
}

impl Completion {
    async fn release(self) {
        match self {
            Completion::Connect(Ok(established)) => established.link.session.close().await,
            Completion::Microphone(Ok(stream)) => drop(stream),
            _ => {}
        }
    }
}

struct Established {
    link: TransportLink,
    microphone: Option<MicrophoneStream>,
}

/// The one background task allowed at a time: a connection attempt while
/// connecting, or a microphone request while connected.
struct Pending {
    generation: u64,
    task: JoinHandle<Completion>,
}

impl Pending {
    async fn cancel(self) {
        self.task.abort();
        if let Ok(completion) = self.task.await {
            completion.release().await;
        }
    }
}

struct LiveSession {
    generation: u64,
    session: Arc<dyn TransportSession>,
    capture: CaptureUnit,
    monitor: RemoteAudioMonitor,
    chat: ChatChannel,
    forwarder: JoinHandle<()>,
}

struct Runtime {
    config: ControllerConfig,
    fetcher: Arc<dyn CredentialFetcher>,
    transport: Arc<dyn Transport>,
    microphone: Arc<dyn Microphone>,
    ops: mpsc::UnboundedSender<Op>,
    state: SessionSnapshot,
    published: watch::Sender<SessionSnapshot>,
    transitions: broadcast::Sender<ConnectionStatus>,
    generation: u64,
    pending: Option<Pending>,
    live: Option<LiveSession>,
    speak_preference: bool,
}

impl Runtime {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op>) {
        loop {
            let op = match self.pending.as_mut() {
                Some(pending) => {
                    let generation = pending.generation;
                    tokio::select! {
                        op = ops.recv() => op,
                        result = &mut pending.task => Some(Op::Completed { generation, result }),
                    }
                }
                None => ops.recv().await,
            };
            match op {
                None | Some(Op::Shutdown) => break,
                Some(op) => {
                    self.apply(op).await;
                    self.publish();
                }
            }
        }

        self.teardown().await;
        self.set_status(ConnectionStatus::Disconnected);
        debug!("Session controller stopped");
    }

    async fn apply(&mut self, op: Op) {
        match op {
            Op::Connect => self.begin_connect(),
            Op::Disconnect => self.disconnect().await,
            Op::ToggleSpeaking => self.toggle_speaking().await,
            Op::SetVolume(percent) => self.set_volume(percent),
            Op::SendChat(text) => self.send_chat(text),
            Op::Completed { generation, result } => {
                // The task has run to completion; its handle must not be polled again.
                self.pending = None;
                self.complete(generation, result).await;
            }
            Op::LocalLevel { generation, level } => {
                if self.is_live(generation) && self.state.is_speaking {
                    self.state.audio_level = level.min(100);
                }
            }
            Op::AgentLevel { generation, level } => {
                // The monitor's envelope outlives a departing agent.
                if self.is_live(generation) && self.state.agent_present {
                    self.state.agent_audio_level = level.min(100);
                }
            }
            Op::Transport { generation, event } => self.on_transport_event(generation, event).await,
            Op::ChatFailed { generation, error } => {
                if self.is_live(generation) {
                    self.report(error);
                }
            }
            Op::CaptureLost {
                generation,
                attachment,
            } => self.on_capture_lost(generation, attachment).await,
            Op::Shutdown => {}
        }
    }

    fn begin_connect(&mut self) {
        if self.state.connection_status != ConnectionStatus::Disconnected {
            debug!(status = %self.state.connection_status, "Ignoring connect: attempt already in flight or connected");
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        let fetcher = self.fetcher.clone();
        let transport = self.transport.clone();
        let microphone = self.microphone.clone();
        let speak = self.speak_preference;
        let timeout = self.config.connect_timeout;

        let task = tokio::spawn(
            async move {
                let result = match tokio::time::timeout(
                    timeout,
                    establish(fetcher, transport, microphone, speak),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SessionError::Transport(format!(
                        "connection attempt timed out after {}s",
                        timeout.as_secs_f32()
                    ))),
                };
                Completion::Connect(result)
            }
            .instrument(info_span!("connect_attempt", generation)),
        );
        self.pending = Some(Pending { generation, task });

        self.state.error = None;
        self.set_status(ConnectionStatus::Connecting);
    }

    async fn disconnect(&mut self) {
        match self.state.connection_status {
            ConnectionStatus::Disconnected => debug!("Ignoring disconnect: already disconnected"),
            ConnectionStatus::Connecting => {
                info!(generation = self.generation, "Aborting connection attempt");
                self.cancel_pending().await;
                self.set_status(ConnectionStatus::Disconnected);
            }
            ConnectionStatus::Connected => {
                self.teardown().await;
                self.set_status(ConnectionStatus::Disconnected);
            }
        }
    }

    async fn complete(&mut self, generation: u64, result: Result<Completion, JoinError>) {
        let completion = match result {
            Ok(completion) => completion,
            Err(e) => {
                error!(error = %e, "Background task failed");
                if generation != self.generation {
                    return;
                }
                match self.state.connection_status {
                    ConnectionStatus::Connecting => {
                        self.report(SessionError::Transport("connection attempt aborted".into()));
                        self.set_status(ConnectionStatus::Disconnected);
                    }
                    _ => self.report(SessionError::PermissionDenied(
                        "microphone request aborted".into(),
                    )),
                }
                return;
            }
        };

        if generation != self.generation {
            debug!(generation, "Releasing result of a superseded task");
            completion.release().await;
            return;
        }

        match completion {
            Completion::Connect(outcome) => {
                if self.state.connection_status != ConnectionStatus::Connecting {
                    Completion::Connect(outcome).release().await;
                    return;
                }
                match outcome {
                    Ok(established) => self.go_live(generation, established).await,
                    Err(e) => {
                        error!(error = %e, "Connection attempt failed");
                        self.report(e);
                        self.set_status(ConnectionStatus::Disconnected);
                    }
                }
            }
            Completion::Microphone(Ok(stream)) => {
                let Some(live) = self.live.as_mut() else {
                    return;
                };
                live.capture.attach(stream, false).await;
                self.state.is_speaking = true;
                self.speak_preference = true;
                info!("Microphone published");
            }
            Completion::Microphone(Err(e)) => {
                warn!(error = %e, "Microphone unavailable");
                self.report(e);
            }
        }
    }

    async fn go_live(&mut self, generation: u64, established: Established) {
        let Established { link, microphone } = established;
        let TransportLink {
            session,
            events,
            remote_audio,
        } = link;
        let interval = self.config.level_interval;

        session.set_playback_volume(self.state.volume / 100.0);

        let speaking = microphone.is_some();
        let ops = self.ops.clone();
        let on_ended: StreamEndedCallback = Arc::new(move |attachment| {
            let _ = ops.send(Op::CaptureLost {
                generation,
                attachment,
            });
        });
        let capture = CaptureUnit::start(
            session.clone(),
            microphone,
            !speaking,
            interval,
            self.level_callback(move |level| Op::LocalLevel { generation, level }),
            on_ended,
        )
        .await;
        let monitor = RemoteAudioMonitor::start(
            remote_audio,
            interval,
            self.level_callback(move |level| Op::AgentLevel { generation, level }),
        );
        let ops = self.ops.clone();
        let chat = ChatChannel::open(
            session.clone(),
            Arc::new(move |error| {
                let _ = ops.send(Op::ChatFailed { generation, error });
            }),
        );
        let forwarder = tokio::spawn(forward_events(events, generation, self.ops.clone()));

        self.live = Some(LiveSession {
            generation,
            session,
            capture,
            monitor,
            chat,
            forwarder,
        });
        self.state.is_speaking = speaking;
        info!(generation, speaking, "Session connected");
        self.set_status(ConnectionStatus::Connected);
    }

    async fn toggle_speaking(&mut self) {
        let Some(live) = self.live.as_mut() else {
            debug!("Ignoring toggle_speaking: not connected");
            return;
        };

        if self.state.is_speaking {
            live.capture.set_muted(true).await;
            self.state.is_speaking = false;
            self.state.audio_level = 0;
            self.speak_preference = false;
            info!("Microphone muted");
        } else if self.pending.is_some() {
            // A second toggle while the device is being requested cancels the request.
            self.cancel_pending().await;
            self.speak_preference = false;
            info!("Microphone request cancelled");
        } else if live.capture.has_device() {
            live.capture.set_muted(false).await;
            self.state.is_speaking = true;
            self.speak_preference = true;
            info!("Microphone unmuted");
        } else {
            let microphone = self.microphone.clone();
            let timeout = self.config.connect_timeout;
            let task = tokio::spawn(async move {
                let result = tokio::time::timeout(timeout, microphone.acquire())
                    .await
                    .unwrap_or_else(|_| {
                        Err(SessionError::PermissionDenied(
                            "timed out waiting for microphone access".to_string(),
                        ))
                    });
                Completion::Microphone(result)
            });
            self.pending = Some(Pending {
                generation: live.generation,
                task,
            });
            debug!("Requesting microphone");
        }
    }

    async fn on_capture_lost(&mut self, generation: u64, attachment: u64) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if live.generation != generation || live.capture.attachment() != attachment {
            debug!(generation, attachment, "Ignoring end of a replaced microphone stream");
            return;
        }
        live.capture.detach().await;
        self.state.is_speaking = false;
        self.state.audio_level = 0;
        warn!("Microphone stream ended during the session");
        self.report(SessionError::PermissionDenied(
            "microphone stream ended".to_string(),
        ));
    }

    fn set_volume(&mut self, percent: f32) {
        let Some(volume) = clamp_volume(percent) else {
            warn!(percent, "Ignoring non-finite volume");
            return;
        };
        self.state.volume = volume;
        if let Some(live) = &self.live {
            live.session.set_playback_volume(volume / 100.0);
        }
    }

    fn send_chat(&mut self, text: String) {
        let Some(live) = &self.live else {
            debug!("Ignoring chat message: not connected");
            return;
        };
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let message = ChatMessage::local(text);
        let sent = live.chat.send(message.to_record());
        self.state.chat_messages.push(message);
        if let Err(e) = sent {
            self.report(e);
        }
    }

    async fn on_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if !self.is_live(generation) {
            debug!(generation, "Dropping event from a finished session");
            return;
        }
        match event {
            TransportEvent::ParticipantJoined { identity, is_agent } => {
                info!(%identity, is_agent, "Participant joined");
                if is_agent {
                    self.state.agent_present = true;
                }
            }
            TransportEvent::ParticipantLeft { identity, is_agent } => {
                info!(%identity, is_agent, "Participant left");
                if is_agent {
                    self.state.agent_present = false;
                    self.state.agent_audio_level = 0;
                }
            }
            TransportEvent::ChatReceived(record) => {
                if let Some(message) = chat::inbound_message(record) {
                    self.state.chat_messages.push(message);
                }
            }
            TransportEvent::Disconnected { reason } => {
                warn!(%reason, "Transport dropped");
                self.teardown().await;
                self.report(SessionError::Transport(format!("connection lost: {}", reason)));
                self.set_status(ConnectionStatus::Disconnected);
            }
        }
    }

    /// Releases capture, monitor, chat and transport, in that order.
    async fn teardown(&mut self) {
        self.cancel_pending().await;
        if let Some(live) = self.live.take() {
            let LiveSession {
                generation,
                session,
                capture,
                monitor,
                chat,
                forwarder,
            } = live;
            capture.stop().await;
            monitor.stop().await;
            chat.close().await;
            forwarder.abort();
            if tokio::time::timeout(self.config.close_timeout, session.close())
                .await
                .is_err()
            {
                warn!(generation, "Transport did not close in time");
            }
            info!(generation, "Session torn down");
        }
        self.state.is_speaking = false;
        self.state.audio_level = 0;
        self.state.agent_audio_level = 0;
        self.state.agent_present = false;
    }

    async fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel().await;
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.generation == generation)
    }

    fn level_callback(&self, make: impl Fn(u8) -> Op + Send + Sync + 'static) -> LevelCallback {
        let ops = self.ops.clone();
        Arc::new(move |level| {
            let _ = ops.send(make(level));
        })
    }

    fn report(&mut self, error: SessionError) {
        self.state.error = Some(error.to_string());
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.state.connection_status == status {
            return;
        }
        self.state.connection_status = status;
        info!(%status, "Connection status changed");
        self.publish();
        let _ = self.transitions.send(status);
    }

    fn publish(&self) {
        self.published.send_if_modified(|current| {
            if *current == self.state {
                false
            } else {
                *current = self.state.clone();
                true
            }
        });
    }
}

async fn establish(
    fetcher: Arc<dyn CredentialFetcher>,
    transport: Arc<dyn Transport>,
    microphone: Arc<dyn Microphone>,
    speak: bool,
) -> Result<Established, SessionError> {
    let credential = fetcher.fetch().await?;
    info!(url = %credential.transport_url, "Credential obtained, opening transport");
    let link = transport.connect(credential).await?;
    let guard = CloseOnDrop(Some(link.session.clone()));

    let microphone = if speak {
        match microphone.acquire().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                guard.close().await;
                return Err(e);
            }
        }
    } else {
        None
    };
    guard.disarm();
    Ok(Established { link, microphone })
}

/// Closes a freshly opened session if the attempt holding it is abandoned
/// before handing it over.
struct CloseOnDrop(Option<Arc<dyn TransportSession>>);

impl CloseOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }

    async fn close(mut self) {
        if let Some(session) = self.0.take() {
            session.close().await;
        }
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let Some(session) = self.0.take() else {
            return;
        };
        debug!("Closing the session of an abandoned connection attempt");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { session.close().await });
        }
    }
}

async fn forward_events(
    mut events: mpsc::Receiver<TransportEvent>,
    generation: u64,
    ops: mpsc::UnboundedSender<Op>,
) {
    while let Some(event) = events.recv().await {
        let last = matches!(event, TransportEvent::Disconnected { .. });
        if ops.send(Op::Transport { generation, event }).is_err() || last {
            return;
        }
    }
    let _ = ops.send(Op::Transport {
        generation,
        event: TransportEvent::Disconnected {
            reason: "transport event stream closed".to_string(),
        },
    });
}

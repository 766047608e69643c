//! Local microphone capture and publishing.

use crate::{
    error::SessionError,
    level::{LevelCallback, LevelMeter},
    transport::TransportSession,
    types::AudioFrame,
};
use async_trait::async_trait;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

/// A live input device. The device is released once `frames` is dropped.
pub struct MicrophoneStream {
    pub frames: mpsc::Receiver<AudioFrame>,
}

/// Called with the attachment number when a device stream ends on its own.
pub type StreamEndedCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Access to the local input device.
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Acquires the device, prompting for permission where the platform does.
    ///
    /// Fails with `SessionError::PermissionDenied` when access is refused or no
    /// device is available.
    async fn acquire(&self) -> Result<MicrophoneStream, SessionError>;
}

/// The capture handle for one session.
///
/// While unmuted, frames from the microphone are published on the transport
/// and a level sample is delivered every `interval`. While muted, frames are
/// discarded and no levels are produced. The device itself is only held once
/// a stream has been attached. Every attachment is numbered, so the end of a
/// replaced stream can be told apart from the end of the current one.
pub struct CaptureUnit {
    transport: Arc<dyn TransportSession>,
    on_level: LevelCallback,
    on_ended: StreamEndedCallback,
    interval: Duration,
    muted: Arc<AtomicBool>,
    attachment: u64,
    pump: Option<JoinHandle<()>>,
}

impl CaptureUnit {
    pub async fn start(
        transport: Arc<dyn TransportSession>,
        stream: Option<MicrophoneStream>,
        muted: bool,
        interval: Duration,
        on_level: LevelCallback,
        on_ended: StreamEndedCallback,
    ) -> Self {
        let mut unit = Self {
            transport,
            on_level,
            on_ended,
            interval,
            muted: Arc::new(AtomicBool::new(true)),
            attachment: 0,
            pump: None,
        };
        if let Some(stream) = stream {
            unit.attach(stream, muted).await;
        }
        unit
    }

    pub fn has_device(&self) -> bool {
        self.pump.is_some()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Number of the most recent attachment.
    pub fn attachment(&self) -> u64 {
        self.attachment
    }

    /// Takes ownership of an acquired device and starts pumping its frames.
    pub async fn attach(&mut self, stream: MicrophoneStream, muted: bool) {
        if let Some(old) = self.pump.take() {
            old.abort();
        }
        self.muted.store(muted, Ordering::Release);
        self.attachment += 1;
        self.pump = Some(tokio::spawn(pump_frames(
            stream.frames,
            self.transport.clone(),
            self.muted.clone(),
            self.interval,
            self.on_level.clone(),
            self.attachment,
            self.on_ended.clone(),
        )));
        self.announce(!muted).await;
    }

    /// Drops the current device and withdraws the track if it was published.
    /// The next unmute needs a freshly attached stream.
    pub async fn detach(&mut self) {
        let was_muted = self.muted.swap(true, Ordering::AcqRel);
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        if !was_muted {
            self.announce(false).await;
        }
    }

    pub async fn set_muted(&mut self, muted: bool) {
        if self.muted.swap(muted, Ordering::AcqRel) == muted {
            return;
        }
        self.announce(!muted).await;
    }

    /// Stops pumping and releases the device.
    pub async fn stop(mut self) {
        self.muted.store(true, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        debug!("Capture stopped");
    }

    async fn announce(&self, published: bool) {
        if let Err(e) = self.transport.set_track_published(published).await {
            warn!(error = %e, published, "Failed to update local track publication");
        }
    }
}

impl Drop for CaptureUnit {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn pump_frames(
    mut frames: mpsc::Receiver<AudioFrame>,
    transport: Arc<dyn TransportSession>,
    muted: Arc<AtomicBool>,
    interval: Duration,
    on_level: LevelCallback,
    attachment: u64,
    on_ended: StreamEndedCallback,
) {
    let mut meter = LevelMeter::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    warn!(attachment, "Microphone stream ended");
                    on_level(0);
                    on_ended(attachment);
                    break;
                };
                if muted.load(Ordering::Acquire) {
                    continue;
                }
                meter.push(&frame.samples);
                if let Err(e) = transport.publish_audio(frame).await {
                    warn!(error = %e, "Failed to publish microphone audio");
                }
            }
            _ = ticker.tick() => {
                if muted.load(Ordering::Acquire) {
                    meter.reset();
                } else {
                    on_level(meter.tick());
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::ChatRecord;
    use std::sync::Mutex;

    /// Records what the capture unit hands to the transport.
    #[derive(Default)]
    pub(crate) struct RecordingSession {
        pub published: Mutex<Vec<bool>>,
        pub frames: Mutex<usize>,
    }

    #[async_trait]
    impl TransportSession for RecordingSession {
        async fn set_track_published(&self, published: bool) -> Result<(), SessionError> {
            self.published.lock().unwrap().push(published);
            Ok(())
        }
        async fn publish_audio(&self, _frame: AudioFrame) -> Result<(), SessionError> {
            *self.frames.lock().unwrap() += 1;
            Ok(())
        }
        async fn send_chat(&self, _record: ChatRecord) -> Result<(), SessionError> {
            Ok(())
        }
        fn set_playback_volume(&self, _gain: f32) {}
        async fn close(&self) {}
    }

    fn level_sink() -> (LevelCallback, mpsc::UnboundedReceiver<u8>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(move |level| {
                let _ = tx.send(level);
            }),
            rx,
        )
    }

    fn ended_sink() -> (StreamEndedCallback, mpsc::UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(move |attachment| {
                let _ = tx.send(attachment);
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn test_unmuted_capture_publishes_and_reports_levels() {
        let session = Arc::new(RecordingSession::default());
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let (on_level, mut levels) = level_sink();

        let unit = CaptureUnit::start(
            session.clone(),
            Some(MicrophoneStream { frames: frames_rx }),
            false,
            Duration::from_millis(10),
            on_level,
            ended_sink().0,
        )
        .await;
        assert!(unit.has_device());
        assert!(!unit.is_muted());

        let mut saw_speech = false;
        for _ in 0..20 {
            frames_tx
                .send(AudioFrame::new(vec![0.5; 480], 24_000))
                .await
                .unwrap();
            if levels.recv().await.unwrap() > 0 {
                saw_speech = true;
                break;
            }
        }
        assert!(saw_speech);
        assert!(*session.frames.lock().unwrap() > 0);
        assert_eq!(session.published.lock().unwrap().as_slice(), &[true]);

        unit.stop().await;
        // The pump dropped its receiver, releasing the device.
        assert!(frames_tx.is_closed());
    }

    #[tokio::test]
    async fn test_muted_capture_drops_frames() {
        let session = Arc::new(RecordingSession::default());
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let (on_level, mut levels) = level_sink();

        let mut unit = CaptureUnit::start(
            session.clone(),
            Some(MicrophoneStream { frames: frames_rx }),
            true,
            Duration::from_millis(10),
            on_level,
            ended_sink().0,
        )
        .await;

        frames_tx
            .send(AudioFrame::new(vec![0.5; 480], 24_000))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*session.frames.lock().unwrap(), 0);
        assert!(levels.try_recv().is_err());

        unit.set_muted(false).await;
        unit.set_muted(false).await;
        unit.set_muted(true).await;
        assert_eq!(
            session.published.lock().unwrap().as_slice(),
            &[false, true, false]
        );
        unit.stop().await;
    }

    #[tokio::test]
    async fn test_start_without_device() {
        let session = Arc::new(RecordingSession::default());
        let (on_level, _levels) = level_sink();
        let unit = CaptureUnit::start(
            session.clone(),
            None,
            true,
            Duration::from_millis(10),
            on_level,
            ended_sink().0,
        )
        .await;

        assert!(!unit.has_device());
        assert!(unit.is_muted());
        assert!(session.published.lock().unwrap().is_empty());
        unit.stop().await;
    }

    #[tokio::test]
    async fn test_lost_stream_is_reported_and_detached() {
        let session = Arc::new(RecordingSession::default());
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let (on_level, _levels) = level_sink();
        let (on_ended, mut ended) = ended_sink();

        let mut unit = CaptureUnit::start(
            session.clone(),
            Some(MicrophoneStream { frames: frames_rx }),
            false,
            Duration::from_millis(10),
            on_level,
            on_ended,
        )
        .await;
        assert_eq!(unit.attachment(), 1);

        drop(frames_tx);
        assert_eq!(ended.recv().await, Some(1));

        unit.detach().await;
        assert!(!unit.has_device());
        assert!(unit.is_muted());
        assert_eq!(session.published.lock().unwrap().as_slice(), &[true, false]);

        // A replacement stream gets the next number.
        let (_frames_tx, frames_rx) = mpsc::channel(8);
        unit.attach(MicrophoneStream { frames: frames_rx }, false).await;
        assert_eq!(unit.attachment(), 2);
        assert!(unit.has_device());
        unit.stop().await;
        assert!(ended.try_recv().is_err());
    }
}

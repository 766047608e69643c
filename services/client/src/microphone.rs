//! Microphone backends for the console client.

use async_trait::async_trait;
use std::sync::Arc;
use voxroom_core::{
    capture::{Microphone, MicrophoneStream},
    error::SessionError,
};

/// Stands in for a device when the build has no audio input support.
/// Every request is refused, so sessions run chat-only.
pub struct UnavailableMicrophone;

#[async_trait]
impl Microphone for UnavailableMicrophone {
    async fn acquire(&self) -> Result<MicrophoneStream, SessionError> {
        Err(SessionError::PermissionDenied(
            "this build has no audio input support".to_string(),
        ))
    }
}

/// The best microphone this build supports.
pub fn default_microphone() -> Arc<dyn Microphone> {
    #[cfg(feature = "native-audio")]
    {
        Arc::new(native::CpalMicrophone::new())
    }
    #[cfg(not(feature = "native-audio"))]
    {
        Arc::new(UnavailableMicrophone)
    }
}

#[cfg(feature = "native-audio")]
pub use native::CpalMicrophone;

#[cfg(feature = "native-audio")]
mod native {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, SampleFormat, SizedSample, Stream};
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};
    use tracing::{info, warn};
    use voxroom_core::types::AudioFrame;
    use voxroom_transport::audio::{ROOM_SAMPLE_RATE, StreamResampler, downmix};

    const FRAME_CAPACITY: usize = 32;
    const RELEASE_POLL: Duration = Duration::from_millis(100);

    /// Captures the default input device through cpal.
    ///
    /// The cpal stream is not `Send`, so each acquisition owns a dedicated
    /// thread that keeps the stream alive until the frame receiver is dropped.
    pub struct CpalMicrophone {
        chunk_size: usize,
    }

    impl Default for CpalMicrophone {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CpalMicrophone {
        pub fn new() -> Self {
            Self { chunk_size: 480 }
        }
    }

    #[async_trait]
    impl Microphone for CpalMicrophone {
        async fn acquire(&self) -> Result<MicrophoneStream, SessionError> {
            let (frames_tx, frames) = mpsc::channel(FRAME_CAPACITY);
            let (ready_tx, ready_rx) = oneshot::channel();
            let chunk_size = self.chunk_size;

            std::thread::Builder::new()
                .name("voxroom-mic".to_string())
                .spawn(move || run_capture(frames_tx, ready_tx, chunk_size))
                .map_err(|e| denied(format!("could not start capture thread: {}", e)))?;

            match ready_rx.await {
                Ok(Ok(())) => Ok(MicrophoneStream { frames }),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(denied("capture thread exited before the device opened")),
            }
        }
    }

    fn denied(detail: impl Into<String>) -> SessionError {
        SessionError::PermissionDenied(detail.into())
    }

    fn run_capture(
        frames: mpsc::Sender<AudioFrame>,
        ready: oneshot::Sender<Result<(), SessionError>>,
        chunk_size: usize,
    ) {
        let stream = match open_stream(frames.clone(), chunk_size) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready.send(Err(denied(format!("could not start input stream: {}", e))));
            return;
        }
        if ready.send(Ok(())).is_err() {
            return;
        }

        while !frames.is_closed() {
            std::thread::sleep(RELEASE_POLL);
        }
        drop(stream);
        info!("Microphone released");
    }

    fn open_stream(frames: mpsc::Sender<AudioFrame>, chunk_size: usize) -> Result<Stream, SessionError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| denied("no input device available"))?;
        info!("Using input device: {}", device.name().unwrap_or_default());

        let supported = device
            .default_input_config()
            .map_err(|e| denied(format!("input device unusable: {}", e)))?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let channels = config.channels as usize;
        let resampler = StreamResampler::to_room(config.sample_rate.0, chunk_size)
            .map_err(|e| denied(format!("unsupported input rate: {}", e)))?;
        info!(
            "Audio config: {} Hz, {} channel(s), {:?}",
            config.sample_rate.0, channels, sample_format
        );

        let on_error = |err: cpal::StreamError| warn!("Audio input stream error: {}", err);
        let stream = match sample_format {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                on_input::<f32>(frames, resampler, channels),
                on_error,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                on_input::<i16>(frames, resampler, channels),
                on_error,
                None,
            ),
            other => return Err(denied(format!("unsupported sample format {:?}", other))),
        };
        stream.map_err(|e| denied(format!("could not open input stream: {}", e)))
    }

    /// Normalises device samples, folds them to mono at the room rate and
    /// hands them on.
    fn on_input<T>(
        frames: mpsc::Sender<AudioFrame>,
        mut resampler: StreamResampler,
        channels: usize,
    ) -> impl FnMut(&[T], &cpal::InputCallbackInfo) + Send + 'static
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let samples: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
            deliver(&frames, resampler.push(&downmix(&samples, channels)));
        }
    }

    fn deliver(frames: &mpsc::Sender<AudioFrame>, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        // Drops frames while the consumer lags.
        let _ = frames.try_send(AudioFrame::new(samples, ROOM_SAMPLE_RATE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_microphone_is_denied() {
        let err = UnavailableMicrophone.acquire().await.err().unwrap();
        assert_eq!(err.kind(), voxroom_core::error::ErrorKind::PermissionDenied);
    }
}

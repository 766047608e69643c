//! Agent audio playback for the console client.
//!
//! Frames from the transport's playback feed are resampled to the output
//! device rate and queued in a ring buffer that the device callback drains.

use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, trace, warn};
use voxroom_core::types::AudioFrame;
use voxroom_transport::audio::StreamResampler;

const QUEUE_SECONDS: usize = 2;
const RESAMPLE_CHUNK: usize = 240;

/// Feeding side of the playback queue. Lives on the async runtime.
pub struct PlaybackWriter {
    producer: HeapProd<f32>,
    resampler: StreamResampler,
}

/// Draining side of the playback queue. Owned by the output callback.
pub struct PlaybackReader {
    consumer: HeapCons<f32>,
    channels: usize,
}

/// A queue holding up to two seconds of audio for a device running at
/// `device_rate` with `channels` interleaved channels.
pub fn playback_queue(
    device_rate: u32,
    channels: usize,
) -> anyhow::Result<(PlaybackWriter, PlaybackReader)> {
    let resampler = StreamResampler::from_room(device_rate, RESAMPLE_CHUNK)?;
    let (producer, consumer) = HeapRb::<f32>::new(device_rate as usize * QUEUE_SECONDS).split();
    Ok((
        PlaybackWriter {
            producer,
            resampler,
        },
        PlaybackReader {
            consumer,
            channels: channels.max(1),
        },
    ))
}

impl PlaybackWriter {
    /// Queues one frame of room audio and returns how many device samples
    /// did not fit.
    pub fn write(&mut self, frame: &AudioFrame) -> usize {
        let samples = self.resampler.push(&frame.samples);
        let written = self.producer.push_slice(&samples);
        samples.len() - written
    }
}

impl PlaybackReader {
    /// Fills an interleaved output buffer, copying each queued sample to
    /// every channel. Silence covers any shortfall.
    pub fn fill(&mut self, out: &mut [f32]) {
        for frame in out.chunks_mut(self.channels) {
            let sample = self.consumer.try_pop().unwrap_or(0.0);
            frame.fill(sample);
        }
    }
}

/// Moves frames from a playback feed into the queue until the feed closes.
pub fn spawn_feeder(
    mut feed: broadcast::Receiver<AudioFrame>,
    mut writer: PlaybackWriter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(frame) => {
                    let dropped = writer.write(&frame);
                    if dropped > 0 {
                        trace!(dropped, "Playback queue full");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Playback fell behind, skipping frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Playback feed closed");
    })
}

#[cfg(feature = "native-audio")]
pub use native::CpalSpeaker;

#[cfg(feature = "native-audio")]
mod native {
    use super::*;
    use anyhow::Context;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, SampleFormat, SizedSample, Stream};
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };
    use tokio::sync::oneshot;
    use tracing::info;

    const RELEASE_POLL: Duration = Duration::from_millis(100);

    /// Plays agent audio on the default output device until dropped.
    ///
    /// The cpal stream is not `Send`, so it is owned by a dedicated thread
    /// that keeps it alive until the speaker is dropped.
    pub struct CpalSpeaker {
        stop: Arc<AtomicBool>,
        feeder: JoinHandle<()>,
    }

    impl CpalSpeaker {
        pub async fn start(feed: broadcast::Receiver<AudioFrame>) -> anyhow::Result<Self> {
            let stop = Arc::new(AtomicBool::new(false));
            let (ready_tx, ready_rx) = oneshot::channel();
            let thread_stop = stop.clone();

            std::thread::Builder::new()
                .name("voxroom-speaker".to_string())
                .spawn(move || run_output(ready_tx, thread_stop))
                .context("could not start playback thread")?;

            let writer = ready_rx
                .await
                .context("playback thread exited before the device opened")??;
            Ok(Self {
                stop,
                feeder: spawn_feeder(feed, writer),
            })
        }
    }

    impl Drop for CpalSpeaker {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Release);
            self.feeder.abort();
        }
    }

    fn run_output(ready: oneshot::Sender<anyhow::Result<PlaybackWriter>>, stop: Arc<AtomicBool>) {
        let (stream, writer) = match open_stream() {
            Ok(opened) => opened,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready.send(Err(anyhow::anyhow!("could not start output stream: {}", e)));
            return;
        }
        if ready.send(Ok(writer)).is_err() {
            return;
        }
        info!("Agent audio playback started");

        while !stop.load(Ordering::Acquire) {
            std::thread::sleep(RELEASE_POLL);
        }
        drop(stream);
        info!("Speaker released");
    }

    fn open_stream() -> anyhow::Result<(Stream, PlaybackWriter)> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("no output device available")?;
        info!("Using output device: {}", device.name().unwrap_or_default());

        let supported = device
            .default_output_config()
            .context("output device unusable")?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let channels = config.channels as usize;
        let (writer, reader) = playback_queue(config.sample_rate.0, channels)?;
        info!(
            "Output config: {} Hz, {} channel(s), {:?}",
            config.sample_rate.0, channels, sample_format
        );

        let on_error = |err: cpal::StreamError| warn!("Audio output stream error: {}", err);
        let stream = match sample_format {
            SampleFormat::F32 => {
                device.build_output_stream(&config, on_output::<f32>(reader), on_error, None)
            }
            SampleFormat::I16 => {
                device.build_output_stream(&config, on_output::<i16>(reader), on_error, None)
            }
            other => anyhow::bail!("unsupported sample format {:?}", other),
        }
        .context("could not open output stream")?;
        Ok((stream, writer))
    }

    fn on_output<T>(
        mut reader: PlaybackReader,
    ) -> impl FnMut(&mut [T], &cpal::OutputCallbackInfo) + Send + 'static
    where
        T: SizedSample + FromSample<f32>,
    {
        let mut scratch = Vec::new();
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.resize(data.len(), 0.0);
            reader.fill(&mut scratch);
            for (out, &sample) in data.iter_mut().zip(&scratch) {
                *out = T::from_sample(sample);
            }
        }
    }
}

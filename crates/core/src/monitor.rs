//! Level monitoring of the remote agent's audio.

use crate::{
    level::{LevelCallback, LevelMeter},
    types::AudioFrame,
};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

/// Computes the agent's volume envelope from the inbound audio track.
///
/// Owned by the session controller: started when a session becomes connected
/// and stopped when it ends.
pub struct RemoteAudioMonitor {
    pump: Option<JoinHandle<()>>,
}

impl RemoteAudioMonitor {
    pub fn start(
        frames: mpsc::Receiver<AudioFrame>,
        interval: Duration,
        on_level: LevelCallback,
    ) -> Self {
        Self {
            pump: Some(tokio::spawn(monitor_frames(frames, interval, on_level))),
        }
    }

    pub async fn stop(mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        debug!("Remote audio monitor stopped");
    }
}

impl Drop for RemoteAudioMonitor {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn monitor_frames(
    mut frames: mpsc::Receiver<AudioFrame>,
    interval: Duration,
    on_level: LevelCallback,
) {
    let mut meter = LevelMeter::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => meter.push(&frame.samples),
                None => {
                    on_level(0);
                    break;
                }
            },
            _ = ticker.tick() => on_level(meter.tick()),
        }
    }
}

//! PCM helpers shared by the room socket and the local audio devices.
//!
//! Room audio is mono f32 at `ROOM_SAMPLE_RATE`, carried on the wire as
//! base64 PCM16 little-endian.

use base64::{Engine, engine::general_purpose::STANDARD};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Sample rate of every audio frame exchanged with the room.
pub const ROOM_SAMPLE_RATE: u32 = 24000;

const PCM16_SCALE: f32 = 32768.0;

/// Converts a mono sample stream of arbitrary callback sizes between two
/// rates. Equal rates pass straight through.
///
/// `FastFixedIn` consumes fixed-size chunks, so input is buffered until a
/// whole chunk is available.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        let resampler = if from_rate == to_rate {
            None
        } else {
            Some(FastFixedIn::<f32>::new(
                f64::from(to_rate) / f64::from(from_rate),
                1.0,
                PolynomialDegree::Cubic,
                chunk_size,
                1,
            )?)
        };
        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    /// Device input to the room rate.
    pub fn to_room(device_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        Self::new(device_rate, ROOM_SAMPLE_RATE, chunk_size)
    }

    /// Room audio to an output device's rate.
    pub fn from_room(device_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        Self::new(ROOM_SAMPLE_RATE, device_rate, chunk_size)
    }

    /// Feeds samples and returns whatever output is ready.
    pub fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };
        self.pending.extend_from_slice(samples);

        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(mut channels) => output.append(&mut channels[0]),
                Err(e) => {
                    tracing::error!("Failed to resample audio chunk: {}", e);
                    break;
                }
            }
        }
        output
    }
}

/// Averages interleaved multi-channel samples down to mono.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Scales samples by `gain`, keeping them in `[-1.0, 1.0]`.
pub fn apply_gain(samples: &[f32], gain: f32) -> Vec<f32> {
    samples
        .iter()
        .map(|&sample| (sample * gain).clamp(-1.0, 1.0))
        .collect()
}

/// Packs samples into the wire payload of an audio frame.
pub fn encode_pcm16(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Saturating cast: NaN becomes silence.
        let value = (sample.clamp(-1.0, 1.0) * PCM16_SCALE).round() as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Unpacks the wire payload of an audio frame. A trailing odd byte is ignored.
pub fn decode_pcm16(payload: &str) -> Result<Vec<f32>, base64::DecodeError> {
    let bytes = STANDARD.decode(payload)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / PCM16_SCALE)
        .collect())
}

//! Volume envelope estimation shared by local capture and the remote monitor.

use std::sync::Arc;
use std::time::Duration;

/// Default cadence at which level callbacks fire (10 Hz).
pub const DEFAULT_LEVEL_INTERVAL: Duration = Duration::from_millis(100);

/// Anything quieter than this is treated as silence.
const SILENCE_FLOOR_DBFS: f32 = -60.0;
const ATTACK: f32 = 0.6;
const RELEASE: f32 = 0.3;
/// Envelope values below this snap to the resting baseline.
const REST_THRESHOLD: f32 = 0.5;

/// Receives one level sample (0-100) per cadence tick.
pub type LevelCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Root-mean-square energy of a block of samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples
        .iter()
        .filter(|s| s.is_finite())
        .map(|s| s * s)
        .sum();
    (sum / samples.len() as f32).sqrt()
}

/// Maps RMS energy onto a 0-100 display scale using a logarithmic curve.
pub fn rms_to_level(rms: f32) -> f32 {
    if !rms.is_finite() || rms <= 0.0 {
        return 0.0;
    }
    let dbfs = 20.0 * rms.log10();
    ((dbfs - SILENCE_FLOOR_DBFS) / -SILENCE_FLOOR_DBFS * 100.0).clamp(0.0, 100.0)
}

/// Smoothed volume envelope.
///
/// Audio blocks are fed with `push`; `tick` is called once per cadence and
/// returns the envelope, which rises quickly on speech and decays to 0 in
/// silence.
#[derive(Debug, Default, Clone)]
pub struct LevelMeter {
    envelope: f32,
    window_peak: Option<f32>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, samples: &[f32]) {
        let level = rms_to_level(rms(samples));
        self.window_peak = Some(self.window_peak.map_or(level, |peak| peak.max(level)));
    }

    pub fn tick(&mut self) -> u8 {
        let target = self.window_peak.take().unwrap_or(0.0);
        let coefficient = if target > self.envelope { ATTACK } else { RELEASE };
        self.envelope += (target - self.envelope) * coefficient;
        if self.envelope < REST_THRESHOLD {
            self.envelope = 0.0;
        }
        self.envelope.round().clamp(0.0, 100.0) as u8
    }

    pub fn reset(&mut self) {
        self.envelope = 0.0;
        self.window_peak = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sine(amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (i as f32 * 0.05).sin())
            .collect()
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert_abs_diff_eq!(rms(&[0.5, -0.5, 0.5, -0.5]), 0.5, epsilon = 0.0001);
        // Non-finite samples do not poison the estimate.
        assert!(rms(&[f32::NAN, 0.5]).is_finite());
    }

    #[test]
    fn test_rms_to_level_scale() {
        assert_eq!(rms_to_level(0.0), 0.0);
        assert_eq!(rms_to_level(f32::NAN), 0.0);
        assert_abs_diff_eq!(rms_to_level(1.0), 100.0, epsilon = 0.001);
        // -30 dBFS sits halfway up the scale.
        assert_abs_diff_eq!(rms_to_level(0.031_622_78), 50.0, epsilon = 0.01);
        assert_eq!(rms_to_level(0.0001), 0.0);
        assert_eq!(rms_to_level(4.0), 100.0);
    }

    #[test]
    fn test_meter_rises_on_speech_and_decays_to_rest() {
        let mut meter = LevelMeter::new();
        let speech = sine(0.5, 2400);

        let mut last = 0;
        for _ in 0..5 {
            meter.push(&speech);
            let level = meter.tick();
            assert!(level >= last, "envelope should not fall while speech continues");
            last = level;
        }
        assert!(last > 50);

        let mut previous = last;
        for _ in 0..40 {
            let level = meter.tick();
            assert!(level <= previous);
            previous = level;
        }
        assert_eq!(previous, 0);
    }

    #[test]
    fn test_meter_stays_in_range() {
        let mut meter = LevelMeter::new();
        meter.push(&[10.0; 256]);
        for _ in 0..10 {
            meter.push(&[10.0; 256]);
            assert!(meter.tick() <= 100);
        }
        meter.reset();
        assert_eq!(meter.tick(), 0);
    }

    #[test]
    fn test_meter_uses_loudest_block_in_window() {
        let mut loud_first = LevelMeter::new();
        loud_first.push(&sine(0.8, 480));
        loud_first.push(&[0.0; 480]);

        let mut loud_only = LevelMeter::new();
        loud_only.push(&sine(0.8, 480));

        assert_eq!(loud_first.tick(), loud_only.tick());
    }
}

//! Audio level metrics and simple signal operations
//!
//! Level computation, silence detection, mixing and gain. Everything works on
//! linear 16-bit samples, does its arithmetic in f32 and clips on the way
//! back to i16.

use crate::{clip_sample, Sample};

/// RMS level of a sample buffer, normalized to `[0, 1]`
pub fn audio_level(samples: &[Sample]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|&s| (s as f32) * (s as f32)).sum();
    let rms = (sum_sq / samples.len() as f32).sqrt();
    (rms / 32768.0).min(1.0)
}

/// Peak absolute level of a sample buffer, normalized to `[0, 1]`
pub fn peak_level(samples: &[Sample]) -> f32 {
    samples
        .iter()
        .map(|&s| (s as f32).abs() / 32768.0)
        .fold(0.0, f32::max)
}

/// Whether a buffer counts as silence.
///
/// A buffer is silent when its RMS level is below `threshold` and it spans at
/// least `min_duration_ms` of audio at `sample_rate`.
pub fn is_silence(samples: &[Sample], sample_rate: u32, threshold: f32, min_duration_ms: u32) -> bool {
    let duration_ms = samples.len() as u64 * 1000 / sample_rate as u64;
    if duration_ms < min_duration_ms as u64 {
        return false;
    }
    audio_level(samples) < threshold
}

/// Mix several equal-length streams by averaging.
///
/// Streams longer than the shortest input are truncated to it.
pub fn mix(streams: &[&[Sample]]) -> Vec<Sample> {
    if streams.is_empty() {
        return Vec::new();
    }
    if streams.len() == 1 {
        return streams[0].to_vec();
    }
    let len = streams.iter().map(|s| s.len()).min().unwrap_or(0);
    let n = streams.len() as f32;
    (0..len)
        .map(|i| {
            let sum: f32 = streams.iter().map(|s| s[i] as f32).sum();
            clip_sample(sum / n)
        })
        .collect()
}

/// Apply gain in decibels, clipping to the i16 range
pub fn apply_gain(samples: &[Sample], gain_db: f32) -> Vec<Sample> {
    if gain_db == 0.0 {
        return samples.to_vec();
    }
    let factor = 10f32.powf(gain_db / 20.0);
    samples.iter().map(|&s| clip_sample(s as f32 * factor)).collect()
}

/// Generate a sine tone as linear PCM
pub fn generate_tone(frequency: f32, duration_ms: u32, sample_rate: u32, amplitude: f32) -> Vec<Sample> {
    let num_samples = (sample_rate as u64 * duration_ms as u64 / 1000) as usize;
    (0..num_samples)
        .map(|n| {
            let t = n as f32 / sample_rate as f32;
            clip_sample(amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin() * 32767.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_of_silence_is_zero() {
        assert_eq!(audio_level(&[0i16; 160]), 0.0);
        assert_eq!(audio_level(&[]), 0.0);
    }

    #[test]
    fn level_of_full_scale() {
        let level = audio_level(&[i16::MAX; 160]);
        assert!(level > 0.99 && level <= 1.0);
    }

    #[test]
    fn silence_requires_duration() {
        // 10 ms of quiet at 8 kHz is below the 20 ms minimum
        assert!(!is_silence(&[0i16; 80], 8000, 0.01, 20));
        assert!(is_silence(&[0i16; 160], 8000, 0.01, 20));
    }

    #[test]
    fn loud_audio_is_not_silence() {
        let tone = generate_tone(440.0, 100, 8000, 0.5);
        assert!(!is_silence(&tone, 8000, 0.01, 20));
    }

    #[test]
    fn mix_averages() {
        let a = [1000i16, -1000, 0];
        let b = [3000i16, 1000, 0];
        let mixed = mix(&[&a, &b]);
        assert_eq!(mixed, vec![2000, 0, 0]);
    }

    #[test]
    fn mix_truncates_to_shortest() {
        let a = [100i16; 10];
        let b = [100i16; 4];
        assert_eq!(mix(&[&a, &b]).len(), 4);
    }

    #[test]
    fn gain_doubles_at_six_db() {
        let out = apply_gain(&[1000i16], 6.0);
        assert!((out[0] as i32 - 1995).abs() <= 5);
    }

    #[test]
    fn gain_clips_at_range() {
        let out = apply_gain(&[30000i16], 12.0);
        assert_eq!(out[0], 32767);
    }

    #[test]
    fn tone_has_expected_length_and_energy() {
        let tone = generate_tone(440.0, 1000, 8000, 0.5);
        assert_eq!(tone.len(), 8000);
        let level = audio_level(&tone);
        // RMS of a 0.5-amplitude sine is ~0.354
        assert!((level - 0.3535).abs() < 0.01, "level={}", level);
    }
}

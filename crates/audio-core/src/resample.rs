//! Sample-rate conversion
//!
//! Linear-interpolation resampling, which is adequate for telephony-band
//! speech. The connector only ever converts between the rates of its three
//! worlds: 8 kHz RTP audio, 16 kHz STT input and 22.05 kHz TTS output.
//! A polyphase filter could be substituted here without changing callers.

use crate::error::{Error, Result};
use crate::{clip_sample, Sample, SampleRate};

/// Sample-rate pairs the pipeline converts between
const SUPPORTED_PAIRS: [(u32, u32); 7] = [
    (8000, 16000),
    (16000, 8000),
    (16000, 22050),
    (22050, 16000),
    (22050, 8000),
    (8000, 22050),
    (48000, 16000),
];

/// Check whether a conversion between two rates is supported
pub fn is_supported(from: u32, to: u32) -> bool {
    from == to || SUPPORTED_PAIRS.contains(&(from, to))
}

/// Resample a mono sample buffer from one rate to another.
///
/// Identity conversions return the input unchanged (bit-exact). Unsupported
/// pairs return [`Error::UnsupportedResample`].
pub fn resample(samples: &[Sample], from: u32, to: u32) -> Result<Vec<Sample>> {
    if from == to {
        return Ok(samples.to_vec());
    }
    if !is_supported(from, to) {
        return Err(Error::UnsupportedResample { from, to });
    }
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let out_len = (samples.len() as u64 * to as u64 / from as u64) as usize;
    if out_len == 0 {
        return Ok(Vec::new());
    }

    let mut out = Vec::with_capacity(out_len);
    let last = (samples.len() - 1) as f64;
    // Map output index n to a fractional source position over [0, len-1]
    // and interpolate between the two neighbouring samples.
    let step = if out_len > 1 { last / (out_len - 1) as f64 } else { 0.0 };
    for n in 0..out_len {
        let pos = n as f64 * step;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx] as f32;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f32;
        out.push(clip_sample(a + (b - a) * frac));
    }
    Ok(out)
}

/// Resample between tagged rates
pub fn resample_frames(samples: &[Sample], from: SampleRate, to: SampleRate) -> Result<Vec<Sample>> {
    resample(samples, from.as_hz(), to.as_hz())
}

/// Downmix interleaved multi-channel samples to mono by arithmetic mean.
///
/// `channels` of 0 or 1 returns the input unchanged.
pub fn downmix(samples: &[Sample], channels: usize) -> Vec<Sample> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| s as f32).sum();
            clip_sample(sum / frame.len() as f32)
        })
        .collect()
}

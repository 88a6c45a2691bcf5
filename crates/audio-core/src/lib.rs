//! # Audio core library for the voxbridge project
//!
//! `audio-core` provides the pure, synchronous audio conversions used by the
//! media path of the connector:
//!
//! - **G.711**: PCMU (μ-law) and PCMA (A-law) companding to and from 16-bit
//!   linear PCM
//! - **Resampling**: telephony-quality linear interpolation between the
//!   sample rates the connector touches (8 kHz RTP, 16 kHz STT, 22.05 kHz TTS)
//! - **Metrics**: RMS level, silence detection, mixing and gain
//! - **Codec descriptors**: payload type, ptime and framing for the codecs
//!   negotiated over SDP
//! - **DTMF**: in-band dual-tone synthesis per ITU-T Q.23
//!
//! Nothing in this crate performs I/O or holds shared state; conversions live
//! at the edges of the media pipeline (receiver ingress, TTS egress).

pub mod codec;
pub mod dtmf;
pub mod error;
pub mod g711;
pub mod metrics;
pub mod resample;

pub use codec::{Codec, CodecKind, FrameSplitter};
pub use error::{Error, Result};

/// Media sample type (raw linear audio)
pub type Sample = i16;

/// Sample rates the connector converts between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleRate {
    /// 8 kHz narrowband telephony (G.711)
    Rate8000,
    /// 16 kHz wideband (speech recognition)
    Rate16000,
    /// 22.05 kHz (TTS engine native rate)
    Rate22050,
    /// 48 kHz (Opus default)
    Rate48000,
}

impl SampleRate {
    /// Get the rate in Hz
    pub fn as_hz(&self) -> u32 {
        match self {
            SampleRate::Rate8000 => 8000,
            SampleRate::Rate16000 => 16000,
            SampleRate::Rate22050 => 22050,
            SampleRate::Rate48000 => 48000,
        }
    }

    /// Look up a supported rate from a Hz value
    pub fn from_hz(hz: u32) -> Option<Self> {
        match hz {
            8000 => Some(SampleRate::Rate8000),
            16000 => Some(SampleRate::Rate16000),
            22050 => Some(SampleRate::Rate22050),
            48000 => Some(SampleRate::Rate48000),
            _ => None,
        }
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        SampleRate::Rate8000
    }
}

/// A chunk of mono 16-bit linear PCM tagged with its sample rate.
///
/// This is the canonical representation handed between components; a frame
/// never exceeds 20 ms of audio at its rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved signed 16-bit samples, mono
    pub samples: Vec<Sample>,
    /// Sample rate of the frame
    pub rate: SampleRate,
}

impl AudioFrame {
    /// Create a frame from samples
    pub fn new(samples: Vec<Sample>, rate: SampleRate) -> Self {
        Self { samples, rate }
    }

    /// Build a frame from little-endian PCM16 bytes; a trailing odd byte is
    /// dropped.
    pub fn from_le_bytes(data: &[u8], rate: SampleRate) -> Self {
        let samples = data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Self { samples, rate }
    }

    /// Serialize the samples as little-endian PCM16 bytes
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    /// Duration of the frame in milliseconds
    pub fn duration_ms(&self) -> u32 {
        (self.samples.len() as u32 * 1000) / self.rate.as_hz()
    }

    /// Number of samples in the frame
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Clip an f32 intermediate value back into the i16 sample range.
///
/// All pipeline arithmetic is done in f32 and clipped on the way out.
#[inline]
pub fn clip_sample(v: f32) -> Sample {
    v.clamp(-32768.0, 32767.0) as Sample
}

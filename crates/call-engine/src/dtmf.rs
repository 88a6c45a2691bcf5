//! DTMF sequence timing and injection
//!
//! Tone synthesis lives in `audio-core`; this module adds the timing shell
//! (pre-delay, tone/pause alternation, post-delay), validation, and the
//! injection of a rendered sequence into a call's outbound RTP queue.

use bytes::Bytes;
use tracing::{debug, info};

use voxbridge_audio_core::{dtmf, Codec, Sample};
use voxbridge_rtp_core::OutboundQueue;

use crate::error::{Error, Result};

/// Timing parameters for a DTMF sequence, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfTiming {
    /// Duration of each tone
    pub tone_ms: u32,
    /// Pause between tones
    pub pause_ms: u32,
    /// Silence before the first tone
    pub pre_delay_ms: u32,
    /// Silence after the last tone
    pub post_delay_ms: u32,
}

impl Default for DtmfTiming {
    fn default() -> Self {
        Self::STANDARD
    }
}

impl DtmfTiming {
    /// Fast timing for modern IVR systems
    pub const FAST: DtmfTiming =
        DtmfTiming { tone_ms: 60, pause_ms: 60, pre_delay_ms: 200, post_delay_ms: 100 };

    /// Standard timing, safe for most IVR systems
    pub const STANDARD: DtmfTiming =
        DtmfTiming { tone_ms: 100, pause_ms: 100, pre_delay_ms: 500, post_delay_ms: 200 };

    /// Slow timing for older or sensitive systems
    pub const SLOW: DtmfTiming =
        DtmfTiming { tone_ms: 150, pause_ms: 150, pre_delay_ms: 800, post_delay_ms: 300 };

    /// Extra-slow timing for legacy equipment
    pub const LEGACY: DtmfTiming =
        DtmfTiming { tone_ms: 200, pause_ms: 200, pre_delay_ms: 1000, post_delay_ms: 500 };

    /// Check the bounds detectors rely on: tones of 40-1000 ms, pauses of at
    /// least 40 ms.
    pub fn validate(&self) -> Result<()> {
        if self.tone_ms < 40 || self.tone_ms > 1000 {
            return Err(Error::Config(format!("DTMF tone duration {} ms out of range", self.tone_ms)));
        }
        if self.pause_ms < 40 {
            return Err(Error::Config(format!("DTMF pause {} ms too short", self.pause_ms)));
        }
        Ok(())
    }

    /// Total duration of a sequence of `digits` tones
    pub fn sequence_duration_ms(&self, digits: usize) -> u32 {
        if digits == 0 {
            return 0;
        }
        self.pre_delay_ms
            + digits as u32 * self.tone_ms
            + (digits as u32 - 1) * self.pause_ms
            + self.post_delay_ms
    }
}

/// A validated dial string with its timing
#[derive(Debug, Clone)]
pub struct DtmfSequence {
    digits: String,
    timing: DtmfTiming,
}

impl DtmfSequence {
    /// Validate digits and timing into a playable sequence
    pub fn new(digits: &str, timing: DtmfTiming) -> Result<Self> {
        dtmf::validate_digits(digits)?;
        timing.validate()?;
        Ok(Self { digits: digits.to_ascii_uppercase(), timing })
    }

    /// The dial string
    pub fn digits(&self) -> &str {
        &self.digits
    }

    /// Total playback duration in milliseconds
    pub fn duration_ms(&self) -> u32 {
        self.timing.sequence_duration_ms(self.digits.chars().count())
    }

    /// Split a long dial string into chunks of at most `max_digits`
    pub fn split(&self, max_digits: usize) -> Vec<DtmfSequence> {
        if self.digits.len() <= max_digits || max_digits == 0 {
            return vec![self.clone()];
        }
        self.digits
            .as_bytes()
            .chunks(max_digits)
            .map(|chunk| DtmfSequence {
                digits: String::from_utf8_lossy(chunk).into_owned(),
                timing: self.timing,
            })
            .collect()
    }

    /// Render the full sequence as linear PCM at `sample_rate`
    pub fn render(&self, sample_rate: u32) -> Result<Vec<Sample>> {
        let mut audio = Vec::new();
        audio.extend(dtmf::generate_silence(self.timing.pre_delay_ms, sample_rate));

        let digits: Vec<char> = self.digits.chars().collect();
        for (i, digit) in digits.iter().enumerate() {
            audio.extend(dtmf::generate_digit(*digit, self.timing.tone_ms, sample_rate)?);
            if i + 1 < digits.len() {
                audio.extend(dtmf::generate_silence(self.timing.pause_ms, sample_rate));
            }
        }

        audio.extend(dtmf::generate_silence(self.timing.post_delay_ms, sample_rate));
        debug!(digits = %self.digits, samples = audio.len(), "rendered DTMF sequence");
        Ok(audio)
    }

    /// Render, encode with the call codec and enqueue onto the outbound
    /// queue as packet-time payloads.
    pub async fn play(&self, codec: &Codec, queue: &OutboundQueue) -> Result<()> {
        let audio = self.render(codec.clock_rate())?;
        let encoded = codec.encode_samples(&audio)?;

        let mut splitter = codec.splitter();
        for payload in splitter.push(&encoded) {
            queue.push(Bytes::from(payload)).await;
        }
        if let Some(tail) = splitter.flush() {
            queue.push(Bytes::from(tail)).await;
        }
        info!(digits = %self.digits, duration_ms = self.duration_ms(), "DTMF sequence enqueued");
        Ok(())
    }
}

//! Codec descriptors for the negotiated media formats
//!
//! A [`Codec`] describes one payload format agreed over SDP: its payload
//! type, clock rate, packet time and how a byte stream is split into
//! RTP-sized payloads. The connector negotiates PCMU, PCMA or Opus.

use crate::error::{Error, Result};
use crate::g711::{self, PCMA_SILENCE, PCMU_SILENCE};
use crate::{AudioFrame, Sample, SampleRate};

/// Default packet time in milliseconds
pub const DEFAULT_PTIME_MS: u32 = 20;

/// Default Opus clock rate when the offer carries no `sprop-maxcapturerate`
pub const OPUS_DEFAULT_RATE: u32 = 48000;

/// The codec families the connector can negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// G.711 μ-law, static payload type 0
    Pcmu,
    /// G.711 A-law, static payload type 8
    Pcma,
    /// Opus, dynamic payload type
    Opus,
}

impl CodecKind {
    /// SDP encoding name
    pub fn name(&self) -> &'static str {
        match self {
            CodecKind::Pcmu => "PCMU",
            CodecKind::Pcma => "PCMA",
            CodecKind::Opus => "opus",
        }
    }
}

/// A negotiated codec: payload type, clock rate and framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    kind: CodecKind,
    payload_type: u8,
    clock_rate: u32,
    ptime_ms: u32,
}

impl Codec {
    /// PCMU at its standard parameters
    pub fn pcmu() -> Self {
        Self { kind: CodecKind::Pcmu, payload_type: 0, clock_rate: 8000, ptime_ms: DEFAULT_PTIME_MS }
    }

    /// PCMA at its standard parameters
    pub fn pcma() -> Self {
        Self { kind: CodecKind::Pcma, payload_type: 8, clock_rate: 8000, ptime_ms: DEFAULT_PTIME_MS }
    }

    /// Opus with a dynamic payload type. `max_capture_rate` comes from the
    /// offer's `sprop-maxcapturerate` parameter when present.
    pub fn opus(payload_type: u8, max_capture_rate: Option<u32>) -> Self {
        Self {
            kind: CodecKind::Opus,
            payload_type,
            clock_rate: max_capture_rate.unwrap_or(OPUS_DEFAULT_RATE),
            ptime_ms: DEFAULT_PTIME_MS,
        }
    }

    /// Build a codec from a static payload type (0 or 8)
    pub fn from_static_payload_type(pt: u8) -> Result<Self> {
        match pt {
            0 => Ok(Self::pcmu()),
            8 => Ok(Self::pcma()),
            other => Err(Error::UnsupportedPayloadType(other)),
        }
    }

    /// Override the packet time (in ms)
    pub fn with_ptime(mut self, ptime_ms: u32) -> Self {
        self.ptime_ms = if ptime_ms == 0 { DEFAULT_PTIME_MS } else { ptime_ms };
        self
    }

    /// Codec family
    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// RTP payload type
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Clock rate in Hz
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Packet time in milliseconds
    pub fn ptime_ms(&self) -> u32 {
        self.ptime_ms
    }

    /// RTP timestamp increment per packet
    pub fn ts_increment(&self) -> u32 {
        self.clock_rate * self.ptime_ms / 1000
    }

    /// Payload length in bytes of one packet-time of audio.
    ///
    /// G.711 carries one byte per sample; Opus frames are variable-length and
    /// report their nominal sample count instead.
    pub fn payload_len(&self) -> usize {
        (self.clock_rate * self.ptime_ms / 1000) as usize
    }

    /// One packet-time of encoded silence
    pub fn silence_frame(&self) -> Vec<u8> {
        match self.kind {
            CodecKind::Pcmu => vec![PCMU_SILENCE; self.payload_len()],
            CodecKind::Pcma => vec![PCMA_SILENCE; self.payload_len()],
            // A minimal Opus frame decodes as comfort silence
            CodecKind::Opus => vec![0xF8, 0xFF, 0xFE],
        }
    }

    /// Decode one RTP payload into a linear frame.
    ///
    /// Only the G.711 families are decoded in-process; Opus payloads are not
    /// transcoded by the connector.
    pub fn decode_payload(&self, payload: &[u8]) -> Result<AudioFrame> {
        let rate = SampleRate::from_hz(self.clock_rate)
            .ok_or_else(|| Error::InvalidData(format!("unmapped clock rate {}", self.clock_rate)))?;
        let samples = match self.kind {
            CodecKind::Pcmu => g711::pcmu_to_pcm16(payload),
            CodecKind::Pcma => g711::pcma_to_pcm16(payload),
            CodecKind::Opus => {
                return Err(Error::InvalidData("opus payloads are relayed, not decoded".into()))
            }
        };
        Ok(AudioFrame::new(samples, rate))
    }

    /// Encode linear samples into this codec's wire format
    pub fn encode_samples(&self, samples: &[Sample]) -> Result<Vec<u8>> {
        match self.kind {
            CodecKind::Pcmu => Ok(g711::pcm16_to_pcmu(samples)),
            CodecKind::Pcma => Ok(g711::pcm16_to_pcma(samples)),
            CodecKind::Opus => Err(Error::InvalidData("opus encoding is not performed in-process".into())),
        }
    }

    /// Create a splitter that chunks encoded bytes into payload-sized pieces
    pub fn splitter(&self) -> FrameSplitter {
        let silence_byte = match self.kind {
            CodecKind::Pcmu => PCMU_SILENCE,
            CodecKind::Pcma => PCMA_SILENCE,
            CodecKind::Opus => 0,
        };
        FrameSplitter { chunk_size: self.payload_len(), silence_byte, leftovers: Vec::new() }
    }
}

/// Splits an encoded byte stream into fixed-size RTP payloads.
///
/// Bytes that do not fill a whole payload are carried over to the next push;
/// [`FrameSplitter::flush`] pads the tail with the codec's silence byte.
#[derive(Debug)]
pub struct FrameSplitter {
    chunk_size: usize,
    silence_byte: u8,
    leftovers: Vec<u8>,
}

impl FrameSplitter {
    /// Feed more encoded bytes, returning every complete payload now available
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.leftovers.extend_from_slice(data);
        let mut chunks = Vec::new();
        while self.leftovers.len() >= self.chunk_size {
            let rest = self.leftovers.split_off(self.chunk_size);
            chunks.push(std::mem::replace(&mut self.leftovers, rest));
        }
        chunks
    }

    /// Flush any carried bytes as a final payload, padded with silence.
    ///
    /// Returns `None` when nothing is pending.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.leftovers.is_empty() {
            return None;
        }
        let mut tail = std::mem::take(&mut self.leftovers);
        tail.resize(self.chunk_size, self.silence_byte);
        Some(tail)
    }

    /// Bytes currently carried over
    pub fn pending(&self) -> usize {
        self.leftovers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcmu_descriptor() {
        let c = Codec::pcmu();
        assert_eq!(c.payload_type(), 0);
        assert_eq!(c.clock_rate(), 8000);
        assert_eq!(c.ts_increment(), 160);
        assert_eq!(c.payload_len(), 160);
        assert_eq!(c.silence_frame(), vec![0xFF; 160]);
    }

    #[test]
    fn opus_rate_from_sprop() {
        let c = Codec::opus(96, Some(16000));
        assert_eq!(c.clock_rate(), 16000);
        let c = Codec::opus(96, None);
        assert_eq!(c.clock_rate(), OPUS_DEFAULT_RATE);
    }

    #[test]
    fn static_payload_lookup() {
        assert_eq!(Codec::from_static_payload_type(0).unwrap().kind(), CodecKind::Pcmu);
        assert_eq!(Codec::from_static_payload_type(8).unwrap().kind(), CodecKind::Pcma);
        assert!(Codec::from_static_payload_type(18).is_err());
    }

    #[test]
    fn splitter_chunks_and_carries() {
        let mut splitter = Codec::pcmu().splitter();
        let chunks = splitter.push(&[0xAAu8; 100]);
        assert!(chunks.is_empty());
        assert_eq!(splitter.pending(), 100);

        let chunks = splitter.push(&[0xBBu8; 300]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 160);
        assert_eq!(&chunks[0][..100], &[0xAA; 100][..]);
        assert_eq!(splitter.pending(), 80);
    }

    #[test]
    fn splitter_flush_pads_with_silence() {
        let mut splitter = Codec::pcmu().splitter();
        splitter.push(&[0x11u8; 10]);
        let tail = splitter.flush().unwrap();
        assert_eq!(tail.len(), 160);
        assert_eq!(&tail[..10], &[0x11; 10][..]);
        assert!(tail[10..].iter().all(|&b| b == 0xFF));
        assert!(splitter.flush().is_none());
    }

    #[test]
    fn decode_encode_payload() {
        let codec = Codec::pcmu();
        let silence = codec.silence_frame();
        let frame = codec.decode_payload(&silence).unwrap();
        assert_eq!(frame.rate, SampleRate::Rate8000);
        assert!(frame.samples.iter().all(|&s| s == 0));
        let encoded = codec.encode_samples(&frame.samples).unwrap();
        assert_eq!(encoded, silence);
    }

    #[test]
    fn ptime_override_adjusts_framing() {
        let c = Codec::pcmu().with_ptime(30);
        assert_eq!(c.payload_len(), 240);
        assert_eq!(c.ts_increment(), 240);
        // A zero override falls back to the default
        let c = Codec::pcmu().with_ptime(0);
        assert_eq!(c.ptime_ms(), DEFAULT_PTIME_MS);
    }
}

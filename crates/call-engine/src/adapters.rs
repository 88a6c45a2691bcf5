//! Built-in service adapters
//!
//! Real deployments wire websocket/gRPC clients for their STT and TTS
//! services through the `media-core` traits. The adapters here cover the
//! cases that need no external service: a recognizer that never hears
//! anything (media-only deployments and smoke tests) and a synthesizer that
//! renders a fixed tone per sentence so the media path can be exercised
//! end-to-end without a model.

use async_trait::async_trait;
use std::time::Duration;

use voxbridge_audio_core::metrics::generate_tone;
use voxbridge_media_core::{
    Result, SttConfig, SttEngine, SttResult, SttStream, TtsChunkStream, TtsEngine,
};

/// An STT engine that accepts audio and never reports a transcript
#[derive(Debug, Default, Clone)]
pub struct NullSttEngine;

struct NullSttStream;

#[async_trait]
impl SttStream for NullSttStream {
    async fn send_audio(&mut self, _pcm: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<SttResult>> {
        tokio::time::sleep(Duration::from_millis(250)).await;
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SttEngine for NullSttEngine {
    async fn open_stream(&self, _config: &SttConfig) -> Result<Box<dyn SttStream>> {
        Ok(Box::new(NullSttStream))
    }
}

/// A TTS engine that renders a short tone per requested sentence.
///
/// Useful for verifying the whole egress path (pacing, encoding, echo gate)
/// with nothing but ears or a packet capture.
#[derive(Debug, Clone)]
pub struct ToneTtsEngine {
    /// Tone frequency in Hz
    pub frequency: f32,
    /// Milliseconds of tone per sentence
    pub duration_ms: u32,
}

impl Default for ToneTtsEngine {
    fn default() -> Self {
        Self { frequency: 440.0, duration_ms: 400 }
    }
}

#[async_trait]
impl TtsEngine for ToneTtsEngine {
    async fn synthesize(&self, _text: &str, _voice: &str, sample_rate: u32) -> Result<TtsChunkStream> {
        let samples = generate_tone(self.frequency, self.duration_ms, sample_rate, 0.5);
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        // One chunk per 100 ms keeps the pacer's streaming path honest
        let chunk = (sample_rate as usize / 10) * 2;
        let chunks: Vec<_> = bytes.chunks(chunk.max(2)).map(|c| Ok(c.to_vec())).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn null_stt_swallows_audio() {
        let engine = NullSttEngine;
        let mut stream = engine.open_stream(&SttConfig::default()).await.unwrap();
        stream.send_audio(&[0u8; 320]).await.unwrap();
        let result = tokio::time::timeout(Duration::from_millis(400), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn tone_tts_streams_pcm_chunks() {
        let engine = ToneTtsEngine::default();
        let mut stream = engine.synthesize("hello.", "default", 22050).await.unwrap();
        let mut total = 0usize;
        while let Some(chunk) = stream.next().await {
            total += chunk.unwrap().len();
        }
        // 400 ms at 22 050 Hz, two bytes per sample
        assert_eq!(total, (22050 * 400 / 1000) * 2);
    }
}

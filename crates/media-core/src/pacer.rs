//! TTS pacing
//!
//! Drives one utterance from text (or a token stream) to RTP-sized payloads
//! on the call's outbound queue:
//!
//! 1. aggregate tokens into sentences so synthesis overlaps generation,
//! 2. stream PCM16 from the TTS engine at its native rate,
//! 3. resample to the telephony rate and encode with the call codec,
//! 4. chunk into packet-time payloads, padding the tail with silence,
//! 5. register every payload with the VAD echo gate before enqueueing.
//!
//! [`TtsPacer::interrupt`] implements barge-in: it cancels the in-flight
//! synthesis, flushes pending queue bytes and clears the TTS-active flag,
//! leaving the sender's RTP bookkeeping untouched.

use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use voxbridge_audio_core::{resample, Codec};
use voxbridge_rtp_core::OutboundQueue;

use crate::engines::{ResponderReply, TtsEngine};
use crate::error::{Error, Result};
use crate::vad::EchoGate;

/// Sentence terminators that close a synthesis unit
const SENTENCE_TERMINATORS: [char; 5] = ['.', '?', '!', ';', '\n'];

/// Buffers streamed tokens until a sentence is complete.
///
/// A sentence ends at a terminator or when the buffer outgrows `max_chars`,
/// whichever comes first; this bounds time-to-first-audio on rambling
/// generators.
#[derive(Debug)]
pub struct SentenceAggregator {
    buffer: String,
    max_chars: usize,
}

impl SentenceAggregator {
    /// Create an aggregator with the given buffer cap
    pub fn new(max_chars: usize) -> Self {
        Self { buffer: String::new(), max_chars: max_chars.max(1) }
    }

    /// Feed a token, returning any sentences completed by it
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);
        let mut sentences = Vec::new();

        loop {
            match self.buffer.find(|c| SENTENCE_TERMINATORS.contains(&c)) {
                Some(idx) => {
                    let rest = self.buffer.split_off(idx + 1);
                    let sentence = std::mem::replace(&mut self.buffer, rest);
                    let sentence = sentence.trim();
                    if !sentence.is_empty() {
                        sentences.push(sentence.to_string());
                    }
                }
                None => break,
            }
        }

        if self.buffer.len() >= self.max_chars {
            let sentence = std::mem::take(&mut self.buffer);
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }

        sentences
    }

    /// Drain whatever remains as a final sentence
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

/// Configuration for the TTS pacer
#[derive(Debug, Clone)]
pub struct TtsPacerConfig {
    /// Voice passed to the TTS engine
    pub voice: String,
    /// Sample rate the engine produces
    pub input_rate: u32,
    /// Telephony rate for the wire (matches the call codec)
    pub output_rate: u32,
    /// Sentence buffer cap in characters
    pub max_sentence_chars: usize,
}

impl Default for TtsPacerConfig {
    fn default() -> Self {
        Self { voice: "default".into(), input_rate: 22050, output_rate: 8000, max_sentence_chars: 200 }
    }
}

/// Drives TTS synthesis onto a call's outbound RTP queue
pub struct TtsPacer {
    engine: Arc<dyn TtsEngine>,
    config: TtsPacerConfig,
    codec: Codec,
    queue: OutboundQueue,
    echo_gate: Arc<EchoGate>,
    interrupted: AtomicBool,
}

impl TtsPacer {
    /// Create a pacer for one call
    pub fn new(
        engine: Arc<dyn TtsEngine>,
        config: TtsPacerConfig,
        codec: Codec,
        queue: OutboundQueue,
        echo_gate: Arc<EchoGate>,
    ) -> Self {
        Self { engine, config, codec, queue, echo_gate, interrupted: AtomicBool::new(false) }
    }

    /// Whether TTS audio is currently in flight
    pub fn is_active(&self) -> bool {
        self.echo_gate.is_tts_active()
    }

    /// Barge-in: cancel the in-flight synthesis, drain pending audio from
    /// the queue and clear the TTS-active flag.
    ///
    /// Safe to call at any time, from any task, repeatedly; interrupting an
    /// idle pacer is a no-op.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let drained = self.queue.clear();
        if drained > 0 {
            debug!(drained, "flushed queued TTS payloads on interrupt");
        }
        self.echo_gate.tts_finished();
    }

    /// Speak a responder reply, either a full string or a token stream.
    ///
    /// Returns `Ok(true)` when playback was fully enqueued, `Ok(false)` when
    /// an interrupt cut it short.
    pub async fn speak(&self, reply: ResponderReply) -> Result<bool> {
        self.interrupted.store(false, Ordering::SeqCst);
        self.echo_gate.register_tts_chunk();

        let outcome = self.speak_inner(reply).await;
        self.echo_gate.tts_finished();

        match outcome {
            Ok(completed) => {
                if completed {
                    info!("TTS utterance fully enqueued");
                } else {
                    // Mop up anything enqueued in the race between the
                    // interrupt draining the queue and this task noticing.
                    self.queue.clear();
                    info!("TTS utterance interrupted");
                }
                Ok(completed)
            }
            Err(e) => {
                warn!(error = %e, "TTS utterance failed");
                Err(e)
            }
        }
    }

    async fn speak_inner(&self, reply: ResponderReply) -> Result<bool> {
        let mut aggregator = SentenceAggregator::new(self.config.max_sentence_chars);
        let mut splitter = self.codec.splitter();

        match reply {
            ResponderReply::Text(text) => {
                let mut sentences = aggregator.push(&text);
                if let Some(rest) = aggregator.flush() {
                    sentences.push(rest);
                }
                for sentence in sentences {
                    if !self.synthesize_sentence(&sentence, &mut splitter).await? {
                        return Ok(false);
                    }
                }
            }
            ResponderReply::Stream(mut tokens) => {
                while let Some(token) = tokens.next().await {
                    if self.interrupted.load(Ordering::SeqCst) {
                        return Ok(false);
                    }
                    for sentence in aggregator.push(&token) {
                        if !self.synthesize_sentence(&sentence, &mut splitter).await? {
                            return Ok(false);
                        }
                    }
                }
                if let Some(rest) = aggregator.flush() {
                    if !self.synthesize_sentence(&rest, &mut splitter).await? {
                        return Ok(false);
                    }
                }
            }
        }

        // Pad the tail of the utterance out to a whole payload
        if let Some(tail) = splitter.flush() {
            if self.interrupted.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.enqueue(tail).await;
        }
        Ok(!self.interrupted.load(Ordering::SeqCst))
    }

    /// Synthesize one sentence and enqueue its payloads. Returns false when
    /// interrupted.
    async fn synthesize_sentence(
        &self,
        sentence: &str,
        splitter: &mut voxbridge_audio_core::FrameSplitter,
    ) -> Result<bool> {
        debug!(sentence = %sentence, "synthesizing");
        let mut stream = self
            .engine
            .synthesize(sentence, &self.config.voice, self.config.input_rate)
            .await?;

        while let Some(chunk) = stream.next().await {
            if self.interrupted.load(Ordering::SeqCst) {
                // Dropping the stream cancels the synthesis
                return Ok(false);
            }
            let chunk = chunk.map_err(|e| Error::TtsFailed(e.to_string()))?;

            let samples: Vec<i16> = chunk
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            let telephony = resample::resample(&samples, self.config.input_rate, self.config.output_rate)?;
            let encoded = self.codec.encode_samples(&telephony)?;

            for payload in splitter.push(&encoded) {
                if self.interrupted.load(Ordering::SeqCst) {
                    return Ok(false);
                }
                self.enqueue(payload).await;
            }
        }
        Ok(true)
    }

    async fn enqueue(&self, payload: Vec<u8>) {
        // Register with the echo gate first so the VAD cannot mistake this
        // audio for the caller once it loops back.
        self.echo_gate.register_tts_chunk();
        self.queue.push(Bytes::from(payload)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    use crate::engines::TtsChunkStream;

    #[test]
    fn aggregator_splits_on_terminators() {
        let mut agg = SentenceAggregator::new(200);
        assert!(agg.push("Hello the").is_empty());
        assert_eq!(agg.push("re. How are").as_slice(), ["Hello there."]);
        assert_eq!(agg.push(" you? Fi").as_slice(), ["How are you?"]);
        assert_eq!(agg.flush().as_deref(), Some("Fi"));
        assert_eq!(agg.flush(), None);
    }

    #[test]
    fn aggregator_caps_runaway_buffers() {
        let mut agg = SentenceAggregator::new(20);
        let sentences = agg.push("a very long stretch of text with no punctuation at all");
        assert_eq!(sentences.len(), 1);
        assert!(agg.flush().is_none());
    }

    #[test]
    fn aggregator_handles_multiple_sentences_in_one_token() {
        let mut agg = SentenceAggregator::new(200);
        let sentences = agg.push("One. Two! Three;");
        assert_eq!(sentences.as_slice(), ["One.", "Two!", "Three;"]);
    }

    /// TTS double producing a constant-sample signal in fixed chunks
    struct FakeTts {
        /// Samples per chunk at the engine rate
        chunk_samples: usize,
        chunks: usize,
        delay: Duration,
    }

    #[async_trait]
    impl TtsEngine for FakeTts {
        async fn synthesize(&self, _text: &str, _voice: &str, _rate: u32) -> crate::Result<TtsChunkStream> {
            let chunk_samples = self.chunk_samples;
            let chunks = self.chunks;
            let delay = self.delay;
            let stream = futures::stream::unfold(0usize, move |i| async move {
                if i >= chunks {
                    return None;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let mut bytes = Vec::with_capacity(chunk_samples * 2);
                for _ in 0..chunk_samples {
                    bytes.extend_from_slice(&1000i16.to_le_bytes());
                }
                Some((Ok(bytes), i + 1))
            });
            Ok(Box::pin(stream))
        }
    }

    fn pacer(engine: FakeTts, queue: OutboundQueue) -> TtsPacer {
        let gate = EchoGate::new(Duration::from_millis(300));
        TtsPacer::new(
            Arc::new(engine),
            TtsPacerConfig::default(),
            Codec::pcmu(),
            queue,
            gate,
        )
    }

    #[tokio::test]
    async fn full_utterance_chunks_to_payload_size() {
        let queue = OutboundQueue::new(256);
        // 5 chunks of 100 ms at 22 050 Hz -> 500 ms -> 4000 samples at 8 kHz
        // -> exactly 25 PCMU payloads of 160 bytes
        let pacer = pacer(FakeTts { chunk_samples: 2205, chunks: 5, delay: Duration::ZERO }, queue.clone());

        let completed = pacer.speak(ResponderReply::Text("Hello there.".into())).await.unwrap();
        assert!(completed);
        assert!(!pacer.is_active(), "tts_active must clear after completion");

        assert_eq!(queue.len(), 25);
        let first = queue.pop().await;
        assert_eq!(first.len(), 160);
        // Constant 1000-sample audio encodes to a constant non-silence byte
        assert_ne!(first[0], 0xFF);
        assert!(first.iter().all(|&b| b == first[0]));
    }

    #[tokio::test]
    async fn short_tail_is_padded_with_silence() {
        let queue = OutboundQueue::new(64);
        // 441 samples at 22 050 Hz -> 160 samples at 8 kHz, then a second
        // partial chunk of 100 samples -> ~36 samples to pad
        let pacer = pacer(FakeTts { chunk_samples: 100, chunks: 1, delay: Duration::ZERO }, queue.clone());

        let completed = pacer.speak(ResponderReply::Text("Hi.".into())).await.unwrap();
        assert!(completed);

        assert_eq!(queue.len(), 1);
        let payload = queue.pop().await;
        assert_eq!(payload.len(), 160);
        // The tail of the payload is PCMU silence padding
        assert_eq!(payload[159], 0xFF);
    }

    #[tokio::test]
    async fn interrupt_cancels_and_drains() {
        let queue = OutboundQueue::new(256);
        let pacer = Arc::new(pacer(
            FakeTts { chunk_samples: 2205, chunks: 50, delay: Duration::from_millis(20) },
            queue.clone(),
        ));

        let speaking = {
            let pacer = pacer.clone();
            tokio::spawn(async move { pacer.speak(ResponderReply::Text("Long speech.".into())).await })
        };

        // Let a few chunks through, then barge in
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(pacer.is_active());
        pacer.interrupt();

        let completed = speaking.await.unwrap().unwrap();
        assert!(!completed, "interrupted utterance must not report completion");
        assert!(!pacer.is_active());
        assert_eq!(queue.len(), 0, "interrupt must leave no TTS bytes queued");
    }

    #[tokio::test]
    async fn interrupt_on_idle_pacer_is_noop() {
        let queue = OutboundQueue::new(8);
        let pacer = pacer(FakeTts { chunk_samples: 10, chunks: 0, delay: Duration::ZERO }, queue.clone());
        pacer.interrupt();
        pacer.interrupt();
        assert!(!pacer.is_active());
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn token_stream_is_aggregated_before_synthesis() {
        let queue = OutboundQueue::new(256);
        let pacer = pacer(FakeTts { chunk_samples: 441, chunks: 1, delay: Duration::ZERO }, queue.clone());

        let tokens = futures::stream::iter(
            vec!["Wel".to_string(), "come".to_string(), ". Goodbye.".to_string()],
        );
        let completed = pacer.speak(ResponderReply::Stream(Box::pin(tokens))).await.unwrap();
        assert!(completed);
        // Two sentences, each one 441-sample chunk -> 160 samples -> one
        // payload each
        assert_eq!(queue.len(), 2);
    }
}

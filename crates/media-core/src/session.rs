//! The per-call speech session
//!
//! One session task owns the speech side of a call: it decodes inbound RTP
//! payloads, gates them through the VAD, streams speech to the STT service,
//! runs the transcript state machine with its timeout watchdog, detects
//! barge-in, and drives responses through the TTS pacer.
//!
//! A companion STT worker task owns the recognizer stream and its reconnect
//! policy; the session talks to it over channels only.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use voxbridge_audio_core::{resample, Codec};

use crate::engines::{Responder, ResponderReply, SttConfig, SttEngine, SttResult, SttStream};
use crate::error::{Error, Result};
use crate::pacer::TtsPacer;
use crate::transcript::TranscriptHandler;
use crate::vad::AdaptiveVad;

/// Fallback utterance when synthesis of the real reply fails
pub const APOLOGY_TEXT: &str = "I did not understand, could you repeat?";

/// Configuration for one speech session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Call identifier, used for logging and responder routing
    pub call_id: String,
    /// STT stream configuration (re-sent on every reconnect)
    pub stt: SttConfig,
    /// Send EOF to the recognizer on close
    pub send_eof: bool,
    /// Force-final after this much continuous speech
    pub speech_timeout: Duration,
    /// Force-final after this much silence following speech
    pub silence_timeout: Duration,
    /// Promote an unchanged partial after this long
    pub stale_partial_timeout: Duration,
    /// Continuous speech during TTS required to trigger barge-in
    pub barge_in_threshold: Duration,
    /// Audio accumulated per VAD decision
    pub vad_chunk_ms: u32,
    /// Watchdog cadence for the timeout checks
    pub watchdog_interval: Duration,
    /// Maximum STT reconnect attempts before the session is failed
    pub max_stt_reconnects: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_id: String::new(),
            stt: SttConfig::default(),
            send_eof: true,
            speech_timeout: Duration::from_secs(10),
            silence_timeout: Duration::from_secs(3),
            stale_partial_timeout: Duration::from_millis(2500),
            barge_in_threshold: Duration::from_millis(1500),
            vad_chunk_ms: 100,
            watchdog_interval: Duration::from_millis(500),
            max_stt_reconnects: 5,
        }
    }
}

/// Observable session milestones, delivered to the call controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// An utterance was committed (by the recognizer or a timeout)
    FinalTranscript(String),
    /// The caller talked over the bot long enough to cancel TTS
    BargeIn,
    /// The session cannot continue (recognizer gone after retries)
    Fatal(String),
}

/// Messages from the STT worker to the session
enum SttWorkerMsg {
    Result(SttResult),
    Failed(String),
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    if *stop.borrow() {
        return;
    }
    while stop.changed().await.is_ok() {
        if *stop.borrow() {
            return;
        }
    }
}

/// The STT worker: owns the recognizer stream, forwards audio, reads
/// results, reconnects with exponential backoff.
struct SttWorker {
    engine: Arc<dyn SttEngine>,
    config: SttConfig,
    send_eof: bool,
    max_reconnects: u32,
    audio_rx: mpsc::Receiver<Vec<u8>>,
    results_tx: mpsc::Sender<SttWorkerMsg>,
    stop: watch::Receiver<bool>,
}

impl SttWorker {
    async fn reconnect(&mut self) -> Result<Box<dyn SttStream>> {
        for attempt in 1..=self.max_reconnects {
            let backoff = Duration::from_secs(2u64.pow(attempt).min(10));
            info!(attempt, backoff_s = backoff.as_secs(), "reconnecting STT stream");
            tokio::select! {
                _ = stopped(&mut self.stop) => return Err(Error::Stopping),
                _ = tokio::time::sleep(backoff) => {}
            }
            match self.engine.open_stream(&self.config).await {
                Ok(stream) => {
                    info!(attempt, "STT stream reconnected");
                    return Ok(stream);
                }
                Err(e) => warn!(attempt, error = %e, "STT reconnect attempt failed"),
            }
        }
        Err(Error::SttReconnectExhausted { attempts: self.max_reconnects })
    }

    async fn run(mut self) {
        let mut stream = match self.engine.open_stream(&self.config).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self
                    .results_tx
                    .send(SttWorkerMsg::Failed(format!("initial STT connect failed: {e}")))
                    .await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = stopped(&mut self.stop) => break,
                audio = self.audio_rx.recv() => match audio {
                    Some(pcm) => {
                        if let Err(e) = stream.send_audio(&pcm).await {
                            warn!(error = %e, "STT send failed, reconnecting");
                            match self.reconnect().await {
                                Ok(s) => stream = s,
                                Err(e) => {
                                    let _ = self.results_tx.send(SttWorkerMsg::Failed(e.to_string())).await;
                                    return;
                                }
                            }
                        }
                    }
                    None => break,
                },
                result = stream.recv() => match result {
                    Ok(Some(r)) => {
                        if self.results_tx.send(SttWorkerMsg::Result(r)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "STT receive failed, reconnecting");
                        match self.reconnect().await {
                            Ok(s) => stream = s,
                            Err(e) => {
                                let _ = self.results_tx.send(SttWorkerMsg::Failed(e.to_string())).await;
                                return;
                            }
                        }
                    }
                },
            }
        }

        if self.send_eof {
            if let Err(e) = stream.close().await {
                debug!(error = %e, "error closing STT stream");
            }
        }
        debug!("STT worker finished");
    }
}

/// The speech session for one call
pub struct SpeechSession {
    config: SessionConfig,
    codec: Codec,
    audio_rx: mpsc::Receiver<Bytes>,
    stt_engine: Arc<dyn SttEngine>,
    responder: Arc<dyn Responder>,
    pacer: Arc<TtsPacer>,
    vad: AdaptiveVad,
    transcript: TranscriptHandler,
    events_tx: mpsc::Sender<SessionEvent>,
    stop: watch::Receiver<bool>,

    vad_buffer: Vec<i16>,
    barge_in_since: Option<Instant>,
    tts_task: Option<JoinHandle<()>>,
}

impl SpeechSession {
    /// Create a session; the VAD must share its echo gate with `pacer`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        codec: Codec,
        audio_rx: mpsc::Receiver<Bytes>,
        stt_engine: Arc<dyn SttEngine>,
        responder: Arc<dyn Responder>,
        pacer: Arc<TtsPacer>,
        vad: AdaptiveVad,
        events_tx: mpsc::Sender<SessionEvent>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            codec,
            audio_rx,
            stt_engine,
            responder,
            pacer,
            vad,
            transcript: TranscriptHandler::new(),
            events_tx,
            stop,
            vad_buffer: Vec::new(),
            barge_in_since: None,
            tts_task: None,
        }
    }

    /// Spawn the session and its STT worker
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let (stt_audio_tx, stt_audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (stt_results_tx, mut stt_results_rx) = mpsc::channel::<SttWorkerMsg>(64);

        let worker = SttWorker {
            engine: self.stt_engine.clone(),
            config: self.config.stt.clone(),
            send_eof: self.config.send_eof,
            max_reconnects: self.config.max_stt_reconnects,
            audio_rx: stt_audio_rx,
            results_tx: stt_results_tx,
            stop: self.stop.clone(),
        };
        let worker_handle = tokio::spawn(worker.run());

        let mut watchdog = tokio::time::interval(self.config.watchdog_interval);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(call_id = %self.config.call_id, "speech session started");

        loop {
            tokio::select! {
                _ = stopped(&mut self.stop) => break,
                payload = self.audio_rx.recv() => match payload {
                    Some(payload) => self.on_audio(&payload, &stt_audio_tx).await,
                    None => break,
                },
                msg = stt_results_rx.recv() => match msg {
                    Some(SttWorkerMsg::Result(result)) => self.on_stt_result(result).await,
                    Some(SttWorkerMsg::Failed(reason)) => {
                        warn!(call_id = %self.config.call_id, reason = %reason, "STT permanently failed");
                        let _ = self.events_tx.send(SessionEvent::Fatal(reason)).await;
                        break;
                    }
                    None => break,
                },
                _ = watchdog.tick() => self.on_watchdog_tick().await,
            }
        }

        // Wind down: cut any in-flight TTS, then let the worker close the
        // recognizer stream. The task is awaited before the interrupt so an
        // aborted synthesis cannot re-arm the echo gate afterwards.
        if let Some(task) = self.tts_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.pacer.interrupt();
        drop(stt_audio_tx);
        let _ = worker_handle.await;
        info!(call_id = %self.config.call_id, "speech session finished");
    }

    /// Decode one RTP payload, run buffered VAD decisions, gate STT and
    /// track barge-in.
    async fn on_audio(&mut self, payload: &[u8], stt_audio_tx: &mpsc::Sender<Vec<u8>>) {
        let frame = match self.codec.decode_payload(payload) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "dropping undecodable payload");
                return;
            }
        };
        let wideband = match resample::resample(
            &frame.samples,
            self.codec.clock_rate(),
            self.config.stt.sample_rate,
        ) {
            Ok(samples) => samples,
            Err(e) => {
                debug!(error = %e, "dropping unresamplable payload");
                return;
            }
        };
        self.vad_buffer.extend_from_slice(&wideband);

        let chunk_len = (self.config.stt.sample_rate as usize * self.config.vad_chunk_ms as usize) / 1000;
        while self.vad_buffer.len() >= chunk_len {
            let rest = self.vad_buffer.split_off(chunk_len);
            let chunk = std::mem::replace(&mut self.vad_buffer, rest);
            self.process_vad_chunk(chunk, stt_audio_tx).await;
        }
    }

    async fn process_vad_chunk(&mut self, chunk: Vec<i16>, stt_audio_tx: &mpsc::Sender<Vec<u8>>) {
        let now = Instant::now();
        let speaking = self.vad.process_at(&chunk, now);

        // Barge-in: continuous speech while the bot is talking
        if self.pacer.is_active() {
            if speaking {
                let since = *self.barge_in_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.config.barge_in_threshold {
                    info!(call_id = %self.config.call_id, "barge-in triggered");
                    self.pacer.interrupt();
                    self.transcript.clear_partial();
                    self.vad.reset_state();
                    self.barge_in_since = None;
                    let _ = self.events_tx.send(SessionEvent::BargeIn).await;
                    return;
                }
            } else {
                // Short blips under the threshold reset the timer
                self.barge_in_since = None;
            }
        } else {
            self.barge_in_since = None;
        }

        // Speech goes to the recognizer only outside TTS playback
        if speaking && !self.pacer.is_active() {
            let mut bytes = Vec::with_capacity(chunk.len() * 2);
            for s in &chunk {
                bytes.extend_from_slice(&s.to_le_bytes());
            }
            if stt_audio_tx.try_send(bytes).is_err() {
                debug!("STT audio channel full, dropping chunk");
            }
        }
    }

    async fn on_stt_result(&mut self, result: SttResult) {
        if let Some(text) = self.transcript.handle(result, Instant::now()) {
            self.commit_final(text).await;
        }
    }

    async fn on_watchdog_tick(&mut self) {
        let now = Instant::now();

        if let Some(speaking_for) = self.vad.speaking_duration(now) {
            if speaking_for >= self.config.speech_timeout {
                warn!(call_id = %self.config.call_id, "speech timeout, forcing final");
                self.force_final("speech timeout").await;
                return;
            }
        }

        if let Some(silent_for) = self.vad.silence_duration(now) {
            if silent_for >= self.config.silence_timeout {
                info!(call_id = %self.config.call_id, "silence timeout, forcing final");
                self.force_final("silence timeout").await;
                return;
            }
        }

        if self
            .transcript
            .has_stale_partial(self.config.stale_partial_timeout, now)
        {
            info!(call_id = %self.config.call_id, "stale partial, promoting to final");
            self.force_final("stale partial").await;
        }
    }

    async fn force_final(&mut self, reason: &str) {
        let text = self.transcript.force_final(reason);
        // Reset regardless so a timeout without a promotable partial does
        // not re-fire every watchdog tick.
        self.vad.reset_state();
        if let Some(text) = text {
            self.commit_final(text).await;
        }
    }

    async fn commit_final(&mut self, text: String) {
        self.vad.reset_state();
        self.barge_in_since = None;

        // A new utterance supersedes whatever the bot was still saying; the
        // old task is awaited out before the interrupt so it cannot re-arm
        // the echo gate.
        if let Some(task) = self.tts_task.take() {
            task.abort();
            let _ = task.await;
        }
        if self.pacer.is_active() {
            self.pacer.interrupt();
        }

        let _ = self.events_tx.send(SessionEvent::FinalTranscript(text.clone())).await;

        let responder = self.responder.clone();
        let pacer = self.pacer.clone();
        let call_id = self.config.call_id.clone();
        self.tts_task = Some(tokio::spawn(async move {
            let reply = match responder.respond(&call_id, &text).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(call_id = %call_id, error = %e, "responder failed, playing apology");
                    ResponderReply::Text(APOLOGY_TEXT.to_string())
                }
            };
            if let Err(e) = pacer.speak(reply).await {
                warn!(call_id = %call_id, error = %e, "TTS failed, playing apology");
                if let Err(e) = pacer.speak(ResponderReply::Text(APOLOGY_TEXT.to_string())).await {
                    warn!(call_id = %call_id, error = %e, "apology playback failed too");
                }
            }
        }));
    }
}

//! The per-call controller
//!
//! [`CallHandle`] owns every resource of one call: the bound RTP socket and
//! its pool slot, the transport tasks, the speech session and the TTS pacer.
//! Other components never hold references back into the call; they observe
//! it through channels, the read-only [`CallHandle::remote_endpoint`]
//! accessor, and the broadcast of committed transcripts.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use voxbridge_audio_core::Codec;
use voxbridge_media_core::{
    AdaptiveVad, EchoGate, Responder, SessionEvent, SpeechSession, SttEngine, TtsEngine, TtsPacer,
    TtsPacerConfig, ResponderReply,
};
use voxbridge_rtp_core::{
    OutboundQueue, PortPool, RtpReceiver, RtpSender, RtpSenderConfig, RtpSessionStats,
};
use voxbridge_sip_core::{choose_codec, MediaAnswer, SdpOffer};

use crate::config::EngineConfig;
use crate::dtmf::{DtmfSequence, DtmfTiming};
use crate::error::{Error, Result};
use crate::scenario::ScenarioPort;

/// Everything a call needs from the process
pub struct CallDeps {
    /// The shared RTP port pool
    pub pool: PortPool,
    /// STT service adapter
    pub stt: Arc<dyn SttEngine>,
    /// TTS service adapter
    pub tts: Arc<dyn TtsEngine>,
    /// Response generation adapter
    pub responder: Arc<dyn Responder>,
    /// Where fatal per-call failures are reported `(call_id, reason)`
    pub fatal_tx: mpsc::Sender<(String, String)>,
}

/// One live call and its resources
pub struct CallHandle {
    call_id: String,
    codec: Codec,
    port: u16,
    advertised_ip: String,
    created_at: Instant,
    paused: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    queue: OutboundQueue,
    stats: Arc<RtpSessionStats>,
    remote_rx: watch::Receiver<Option<SocketAddr>>,
    pacer: Arc<TtsPacer>,
    responder: Arc<dyn Responder>,
    finals_tx: broadcast::Sender<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl CallHandle {
    /// Allocate a port, negotiate the codec and spawn every task of a call.
    ///
    /// Returns the handle together with the media answer for the 200 OK.
    pub async fn setup(
        call_id: &str,
        offer: &SdpOffer,
        config: &EngineConfig,
        deps: &CallDeps,
    ) -> Result<(Arc<Self>, MediaAnswer)> {
        let mut codec = choose_codec(offer, &config.codec.preference_order())?;
        if config.codec.ptime_ms > 0 {
            codec = codec.with_ptime(config.codec.ptime_ms);
        }

        let bound = deps.pool.acquire(config.rtp.bind_ip)?;
        let port = bound.port;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (remote_tx, remote_rx) = watch::channel(None);
        let (payload_tx, payload_rx) = mpsc::channel(128);
        let (events_tx, mut events_rx) = mpsc::channel(32);
        let (finals_tx, _) = broadcast::channel(16);

        let paused = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(RtpSessionStats::default());
        let queue = OutboundQueue::new(256);

        let echo_gate = EchoGate::new(Duration::from_millis(config.vad.tts_cooldown_ms as u64));
        let vad = AdaptiveVad::new(config.vad.vad_config(), echo_gate.clone());

        let pacer = Arc::new(TtsPacer::new(
            deps.tts.clone(),
            TtsPacerConfig {
                voice: config.tts.voice.clone(),
                input_rate: config.tts.input_rate,
                output_rate: config.tts.target_output_rate,
                max_sentence_chars: 200,
            },
            codec.clone(),
            queue.clone(),
            echo_gate,
        ));

        let session = SpeechSession::new(
            config.session.session_config(call_id),
            codec.clone(),
            payload_rx,
            deps.stt.clone(),
            deps.responder.clone(),
            pacer.clone(),
            vad,
            events_tx,
            stop_rx.clone(),
        );

        let receiver = RtpReceiver::new(
            bound.socket.clone(),
            paused.clone(),
            stop_rx.clone(),
            remote_tx,
            payload_tx,
            stats.clone(),
        )
        .with_receive_buffer_size(config.rtp.receive_buffer_size);

        let sender = RtpSender::new(
            bound.socket,
            RtpSenderConfig::new(codec.clone()),
            queue.clone(),
            paused.clone(),
            stop_rx,
            remote_rx.clone(),
            stats.clone(),
        );

        // Session milestones: fan finals out to scenario listeners, escalate
        // fatal failures to the engine.
        let monitor = {
            let call_id = call_id.to_string();
            let finals_tx = finals_tx.clone();
            let fatal_tx = deps.fatal_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    match event {
                        SessionEvent::FinalTranscript(text) => {
                            let _ = finals_tx.send(text);
                        }
                        SessionEvent::BargeIn => {
                            debug!(call_id = %call_id, "barge-in observed");
                        }
                        SessionEvent::Fatal(reason) => {
                            warn!(call_id = %call_id, reason = %reason, "session fatal");
                            let _ = fatal_tx.send((call_id.clone(), reason)).await;
                            break;
                        }
                    }
                }
            })
        };

        let tasks = vec![session.spawn(), receiver.spawn(), sender.spawn(), monitor];

        let handle = Arc::new(Self {
            call_id: call_id.to_string(),
            codec: codec.clone(),
            port,
            advertised_ip: config.sip.advertised_ip.clone(),
            created_at: Instant::now(),
            paused,
            stop_tx,
            queue,
            stats,
            remote_rx,
            pacer,
            responder: deps.responder.clone(),
            finals_tx,
            tasks: Mutex::new(tasks),
            closing: AtomicBool::new(false),
        });

        info!(call_id = %call_id, port, codec = %codec.kind().name(), "call set up");
        Ok((handle.clone(), handle.media_answer()))
    }

    /// The media parameters this call advertises in its answer SDP
    pub fn media_answer(&self) -> MediaAnswer {
        MediaAnswer {
            advertised_ip: self.advertised_ip.clone(),
            local_port: self.port,
            codec: self.codec.clone(),
        }
    }

    /// Call identifier
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Bound RTP port (released by the engine after close)
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Negotiated codec
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Learned remote media endpoint, once the first packet arrived
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        *self.remote_rx.borrow()
    }

    /// Packet counters
    pub fn stats(&self) -> &RtpSessionStats {
        &self.stats
    }

    /// Outbound queue (DTMF injection and tests)
    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Uptime of the call
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Stop delivering inbound audio (the sender keeps the stream alive
    /// without emitting comfort silence)
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::Relaxed) {
            info!(call_id = %self.call_id, "call paused");
        }
    }

    /// Resume inbound audio
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::Relaxed) {
            info!(call_id = %self.call_id, "call resumed");
        }
    }

    /// Subscribe to committed transcripts
    pub fn subscribe_finals(&self) -> broadcast::Receiver<String> {
        self.finals_tx.subscribe()
    }

    /// Stop every task of the call. Idempotent; bounded by `grace`.
    pub async fn close(&self, grace: Duration) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(call_id = %self.call_id, age_s = self.age().as_secs(), "closing call");
        let _ = self.stop_tx.send(true);
        self.pacer.interrupt();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let joined = futures::future::join_all(tasks);
        if tokio::time::timeout(grace, joined).await.is_err() {
            warn!(call_id = %self.call_id, "call tasks did not wind down within grace, detaching");
        }
        debug!(call_id = %self.call_id, packets_in = self.stats.packets_in(), packets_out = self.stats.packets_out(), "call closed");
    }

    /// Wait until the outbound queue has drained (playback caught up)
    async fn wait_queue_drained(&self, max_wait: Duration) {
        let deadline = Instant::now() + max_wait;
        while !self.queue.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl ScenarioPort for CallHandle {
    async fn play_prompt(&self, text: &str, wait_for_playback: bool) -> Result<()> {
        let completed = self
            .pacer
            .speak(ResponderReply::Text(text.to_string()))
            .await
            .map_err(Error::Media)?;
        if completed && wait_for_playback {
            // Playback lags enqueueing by the paced sender's drain rate
            self.wait_queue_drained(Duration::from_secs(60)).await;
        }
        Ok(())
    }

    async fn listen_for_final(&self, max_wait: Duration) -> Result<Option<String>> {
        let mut finals = self.subscribe_finals();
        match tokio::time::timeout(max_wait, finals.recv()).await {
            Ok(Ok(text)) => Ok(Some(text)),
            Ok(Err(_)) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    async fn send_dtmf(&self, sequence: &str, timing: &DtmfTiming) -> Result<()> {
        let sequence = DtmfSequence::new(sequence, *timing)?;
        let duration = Duration::from_millis(sequence.duration_ms() as u64);
        sequence.play(&self.codec, &self.queue).await?;
        // Let the paced sender actually play it out
        self.wait_queue_drained(duration + Duration::from_secs(5)).await;
        Ok(())
    }

    async fn classify_intent(&self, text: &str) -> Result<Option<String>> {
        self.responder
            .intent(&self.call_id, text)
            .await
            .map_err(Error::Media)
    }
}

//! The process-wide call engine
//!
//! Owns the call registry and the RTP port pool, reacts to switch events and
//! SIP requests, and tears everything down on shutdown. Calls are strictly
//! isolated: a failure inside one call ends that call only.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use voxbridge_media_core::{Responder, SttEngine, TtsEngine};
use voxbridge_rtp_core::PortPool;
use voxbridge_sip_core::{
    InviteHandler, InviteOutcome, MediaAnswer, SdpOffer, SwitchEvent,
};

use crate::call::{CallDeps, CallHandle};
use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Grace allowed for a full process shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The connector's call registry and orchestration hub
pub struct CallEngine {
    config: EngineConfig,
    pool: PortPool,
    calls: DashMap<String, Arc<CallHandle>>,
    stt: Arc<dyn SttEngine>,
    tts: Arc<dyn TtsEngine>,
    responder: Arc<dyn Responder>,
    fatal_tx: mpsc::Sender<(String, String)>,
    fatal_rx: parking_lot::Mutex<Option<mpsc::Receiver<(String, String)>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl CallEngine {
    /// Create an engine with its service adapters
    pub fn new(
        config: EngineConfig,
        stt: Arc<dyn SttEngine>,
        tts: Arc<dyn TtsEngine>,
        responder: Arc<dyn Responder>,
    ) -> Arc<Self> {
        let pool = PortPool::new(config.rtp.pool_config());
        let (fatal_tx, fatal_rx) = mpsc::channel(64);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            pool,
            calls: DashMap::new(),
            stt,
            tts,
            responder,
            fatal_tx,
            fatal_rx: parking_lot::Mutex::new(Some(fatal_rx)),
            shutdown_tx,
        })
    }

    /// A stop signal listeners can select on; flips on [`CallEngine::shutdown`]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// The engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of live calls
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    /// Look up a live call
    pub fn call(&self, call_id: &str) -> Option<Arc<CallHandle>> {
        self.calls.get(call_id).map(|entry| entry.value().clone())
    }

    /// Create a call for an offer: allocate a port, negotiate a codec and
    /// spawn the per-call tasks.
    pub async fn create_call(&self, call_id: &str, offer: &SdpOffer) -> Result<MediaAnswer> {
        if self.calls.contains_key(call_id) {
            return Err(Error::DuplicateCall(call_id.to_string()));
        }

        let deps = CallDeps {
            pool: self.pool.clone(),
            stt: self.stt.clone(),
            tts: self.tts.clone(),
            responder: self.responder.clone(),
            fatal_tx: self.fatal_tx.clone(),
        };
        let (handle, answer) = CallHandle::setup(call_id, offer, &self.config, &deps).await?;

        // A call-start event and an INVITE for the same id can race here;
        // the entry API lets the loser back off without displacing the
        // winner. The guard is resolved before the loser's async cleanup.
        let registered = match self.calls.entry(call_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(handle.clone());
                true
            }
        };
        if !registered {
            handle.close(self.close_grace()).await;
            self.pool.release(handle.port());
            return Err(Error::DuplicateCall(call_id.to_string()));
        }

        info!(call_id = %call_id, active = self.calls.len(), "call registered");
        Ok(answer)
    }

    /// Tear down a call and return its port to the pool. Returns whether the
    /// call existed.
    pub async fn end_call(&self, call_id: &str, reason: &str) -> bool {
        let Some((_, handle)) = self.calls.remove(call_id) else {
            debug!(call_id = %call_id, "end for unknown call");
            return false;
        };
        info!(call_id = %call_id, reason = %reason, "ending call");
        handle.close(self.close_grace()).await;
        self.pool.release(handle.port());
        true
    }

    /// Grace given to a call's tasks on teardown
    fn close_grace(&self) -> Duration {
        Duration::from_millis(self.config.rtp.sender_stop_timeout_ms)
    }

    /// React to one switch event
    pub async fn handle_switch_event(&self, event: SwitchEvent) {
        match event {
            SwitchEvent::CallStart { call_id, sdp, .. } => {
                let Some(sdp) = sdp else {
                    warn!(call_id = %call_id, "call start event without SDP, waiting for INVITE");
                    return;
                };
                let offer = match SdpOffer::parse(&sdp) {
                    Ok(offer) => offer,
                    Err(e) => {
                        warn!(call_id = %call_id, error = %e, "call start event carried bad SDP");
                        return;
                    }
                };
                if let Err(e) = self.create_call(&call_id, &offer).await {
                    warn!(call_id = %call_id, error = %e, "failed to create call from event");
                }
            }
            SwitchEvent::CallAnswered { call_id } => {
                debug!(call_id = %call_id, "call answered");
            }
            SwitchEvent::CallEnd { call_id, reason } => {
                self.end_call(&call_id, reason.as_deref().unwrap_or("switch event")).await;
            }
        }
    }

    /// Spawn the engine's main loop: consumes switch events and per-call
    /// fatal reports until shutdown.
    pub fn start(self: &Arc<Self>, mut events_rx: mpsc::Receiver<SwitchEvent>) -> JoinHandle<()> {
        let engine = self.clone();
        let mut fatal_rx = self
            .fatal_rx
            .lock()
            .take()
            .expect("engine main loop started twice");
        let mut shutdown = self.shutdown_signal();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events_rx.recv() => match event {
                        Some(event) => engine.handle_switch_event(event).await,
                        None => break,
                    },
                    fatal = fatal_rx.recv() => match fatal {
                        Some((call_id, reason)) => {
                            warn!(call_id = %call_id, reason = %reason, "call failed, tearing down");
                            engine.end_call(&call_id, &reason).await;
                        }
                        None => break,
                    },
                }
            }
            debug!("engine main loop finished");
        })
    }

    /// Cancel every call in parallel and signal listeners to stop.
    pub async fn shutdown(&self) {
        info!(active = self.calls.len(), "engine shutting down");
        let _ = self.shutdown_tx.send(true);

        let ids: Vec<String> = self.calls.iter().map(|e| e.key().clone()).collect();
        let teardown = futures::future::join_all(
            ids.iter().map(|id| self.end_call(id, "shutdown")),
        );
        if tokio::time::timeout(SHUTDOWN_GRACE, teardown).await.is_err() {
            warn!("shutdown grace expired with calls still closing");
        }
        info!("engine shut down");
    }
}

#[async_trait]
impl InviteHandler for CallEngine {
    async fn on_invite(&self, call_id: &str, offer: &SdpOffer) -> InviteOutcome {
        match self.create_call(call_id, offer).await {
            Ok(answer) => InviteOutcome::Answer(answer),
            Err(Error::DuplicateCall(_)) => {
                // Retransmit racing ahead of the backend's suppression set:
                // answer with the existing call's parameters.
                match self.call(call_id) {
                    Some(handle) => InviteOutcome::Answer(handle.media_answer()),
                    None => InviteOutcome::Reject(500),
                }
            }
            Err(Error::Sip(voxbridge_sip_core::Error::NoSupportedCodec)) => InviteOutcome::Reject(488),
            Err(Error::Rtp(voxbridge_rtp_core::Error::NoAvailablePorts { .. })) => {
                warn!(call_id = %call_id, "no RTP ports left, rejecting call");
                InviteOutcome::Reject(503)
            }
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "call setup failed");
                InviteOutcome::Reject(500)
            }
        }
    }

    async fn on_bye(&self, call_id: &str) -> bool {
        self.end_call(call_id, "BYE").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    use voxbridge_media_core::EchoResponder;

    use crate::adapters::{NullSttEngine, ToneTtsEngine};

    fn test_engine(min_port: u16, max_port: u16) -> Arc<CallEngine> {
        let mut config = EngineConfig::default();
        config.rtp.bind_ip = "127.0.0.1".parse().unwrap();
        config.rtp.min_port = min_port;
        config.rtp.max_port = max_port;
        CallEngine::new(
            config,
            Arc::new(NullSttEngine),
            Arc::new(ToneTtsEngine::default()),
            Arc::new(EchoResponder),
        )
    }

    fn offer() -> SdpOffer {
        SdpOffer::parse(
            "v=0\r\nc=IN IP4 127.0.0.1\r\nm=audio 40000 RTP/AVP 0 8\r\na=rtpmap:0 PCMU/8000\r\n",
        )
        .unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn invite_creates_and_bye_releases() {
        let engine = test_engine(41000, 41009);

        let outcome = engine.on_invite("call-a", &offer()).await;
        let answer = match outcome {
            InviteOutcome::Answer(answer) => answer,
            other => panic!("expected answer, got {other:?}"),
        };
        assert!(answer.local_port >= 41000 && answer.local_port <= 41009);
        assert_eq!(answer.codec.payload_type(), 0);
        assert_eq!(engine.active_calls(), 1);

        assert!(engine.on_bye("call-a").await);
        assert_eq!(engine.active_calls(), 0);
        // The port returned to the pool promptly
        assert_eq!(engine.pool.available(), 10);
        // A BYE for a gone call reports unknown
        assert!(!engine.on_bye("call-a").await);
    }

    #[tokio::test]
    #[serial]
    async fn port_exhaustion_rejects_with_503() {
        let engine = test_engine(41100, 41100);

        let first = engine.on_invite("call-one", &offer()).await;
        assert!(matches!(first, InviteOutcome::Answer(_)));

        let second = engine.on_invite("call-two", &offer()).await;
        assert!(matches!(second, InviteOutcome::Reject(503)));

        engine.end_call("call-one", "test over").await;
    }

    #[tokio::test]
    #[serial]
    async fn duplicate_invite_reanswers_same_parameters() {
        let engine = test_engine(41200, 41209);

        let first = match engine.on_invite("dup", &offer()).await {
            InviteOutcome::Answer(a) => a,
            other => panic!("expected answer, got {other:?}"),
        };
        let second = match engine.on_invite("dup", &offer()).await {
            InviteOutcome::Answer(a) => a,
            other => panic!("expected answer, got {other:?}"),
        };
        assert_eq!(first.local_port, second.local_port);
        assert_eq!(engine.active_calls(), 1);

        engine.end_call("dup", "test over").await;
    }

    #[tokio::test]
    #[serial]
    async fn codec_mismatch_rejects_with_488() {
        let engine = test_engine(41300, 41309);
        let g729_only =
            SdpOffer::parse("v=0\r\nc=IN IP4 127.0.0.1\r\nm=audio 40000 RTP/AVP 18\r\n").unwrap();
        let outcome = engine.on_invite("mismatch", &g729_only).await;
        assert!(matches!(outcome, InviteOutcome::Reject(488)));
        assert_eq!(engine.active_calls(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn switch_events_drive_lifecycle() {
        let engine = test_engine(41400, 41409);

        engine
            .handle_switch_event(SwitchEvent::CallStart {
                call_id: "ev-1".into(),
                sdp: Some(
                    "v=0\r\nc=IN IP4 127.0.0.1\r\nm=audio 40000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n"
                        .into(),
                ),
                caller: Some("alice".into()),
                callee: Some("bot".into()),
            })
            .await;
        assert_eq!(engine.active_calls(), 1);

        engine
            .handle_switch_event(SwitchEvent::CallEnd { call_id: "ev-1".into(), reason: None })
            .await;
        assert_eq!(engine.active_calls(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn shutdown_closes_all_calls() {
        let engine = test_engine(41500, 41509);
        for i in 0..3 {
            let outcome = engine.on_invite(&format!("bulk-{i}"), &offer()).await;
            assert!(matches!(outcome, InviteOutcome::Answer(_)));
        }
        assert_eq!(engine.active_calls(), 3);

        engine.shutdown().await;
        assert_eq!(engine.active_calls(), 0);
        assert_eq!(engine.pool.available(), 10);
        assert!(*engine.shutdown_signal().borrow());
    }
}

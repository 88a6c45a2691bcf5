//! SIP backend task
//!
//! Answers the INVITE the switch forwards for each call and the BYE that
//! ends it. The backend owns no call state beyond response bookkeeping; the
//! decision of how to answer (allocate a port, pick a codec) is delegated to
//! an [`InviteHandler`] implemented by the call engine.
//!
//! No transaction layer is implemented: retransmitted INVITEs for a call
//! that was already answered are suppressed, everything else is left to the
//! switch.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::message::{SipRequest, SipResponse};
use crate::sdp::{MediaAnswer, SdpOffer};

/// How the call engine answered an INVITE
#[derive(Debug)]
pub enum InviteOutcome {
    /// Answer with the given media parameters (200 OK)
    Answer(MediaAnswer),
    /// Reject with a SIP status code (488, 503, 500, ...)
    Reject(u16),
}

/// Decides how INVITE and BYE requests are handled
#[async_trait]
pub trait InviteHandler: Send + Sync + 'static {
    /// An INVITE arrived with a parsed offer; allocate resources and answer
    async fn on_invite(&self, call_id: &str, offer: &SdpOffer) -> InviteOutcome;

    /// A BYE arrived; returns whether the call existed
    async fn on_bye(&self, call_id: &str) -> bool;
}

/// Configuration for the SIP backend socket
#[derive(Debug, Clone)]
pub struct SipBackendConfig {
    /// Address the switch sends SIP requests to
    pub bind_addr: SocketAddr,
    /// Host placed in the `Contact` header
    pub advertised_host: String,
    /// User part of the `Contact` URI
    pub service_user: String,
    /// Datagram buffer size
    pub buffer_size: usize,
}

impl Default for SipBackendConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8089".parse().expect("static addr"),
            advertised_host: "127.0.0.1".into(),
            service_user: "voxbridge".into(),
            buffer_size: 16384,
        }
    }
}

/// The UDP task answering SIP requests from the switch
pub struct SipBackend {
    socket: UdpSocket,
    config: SipBackendConfig,
    handler: Arc<dyn InviteHandler>,
    stop: watch::Receiver<bool>,
    /// `(call_id, status)` pairs already answered, for retransmit suppression
    sent_responses: HashSet<(String, u16)>,
    /// Stable to-tags per call
    call_tags: HashMap<String, String>,
}

fn random_tag() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect()
}

impl SipBackend {
    /// Bind the SIP socket
    pub async fn bind(
        mut config: SipBackendConfig,
        handler: Arc<dyn InviteHandler>,
        stop: watch::Receiver<bool>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        // Record the resolved address so Contact headers carry the real port
        config.bind_addr = socket.local_addr()?;
        info!(addr = %config.bind_addr, "SIP backend bound");
        Ok(Self {
            socket,
            config,
            handler,
            stop,
            sent_responses: HashSet::new(),
            call_tags: HashMap::new(),
        })
    }

    /// Local address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawn the request loop
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut buf = vec![0u8; self.config.buffer_size];
        loop {
            let (len, src) = tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                    continue;
                }
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "SIP socket receive failed");
                        continue;
                    }
                },
            };

            let datagram = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s,
                Err(_) => {
                    warn!(from = %src, len, "dropping non-UTF8 SIP datagram");
                    continue;
                }
            };

            let request = match SipRequest::parse(datagram) {
                Ok(r) => r,
                Err(e) => {
                    // Without parseable headers there is nothing to reply to
                    warn!(from = %src, error = %e, "dropping unparseable SIP datagram");
                    continue;
                }
            };

            if let Some(response) = self.dispatch(&request).await {
                let status = response.status();
                if let Err(e) = self.socket.send_to(response.to_wire().as_bytes(), src).await {
                    warn!(error = %e, to = %src, "failed to send SIP response");
                } else {
                    info!(method = %request.method, status, to = %src, "SIP response sent");
                }
            }
        }
        debug!("SIP backend finished");
    }

    async fn dispatch(&mut self, request: &SipRequest) -> Option<SipResponse> {
        match request.method.as_str() {
            "INVITE" => self.handle_invite(request).await,
            "BYE" => self.handle_bye(request).await,
            // ACKs complete the handshake; nothing to answer
            "ACK" => None,
            // Mid-dialog NOTIFYs from the switch are acknowledged and ignored
            "NOTIFY" => Some(SipResponse::to_request(request, 200, None)),
            other => {
                debug!(method = %other, "unsupported SIP method");
                Some(SipResponse::to_request(request, 405, None))
            }
        }
    }

    async fn handle_invite(&mut self, request: &SipRequest) -> Option<SipResponse> {
        let call_id = match request.call_id() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Some(SipResponse::to_request(request, 400, None)),
        };

        if self.sent_responses.contains(&(call_id.clone(), 200)) {
            // Retransmitted INVITE for an answered call; the switch owns
            // retransmit handling, we stay quiet.
            debug!(call_id = %call_id, "suppressing duplicate 200 OK");
            return None;
        }

        if let Some(ct) = request.header("Content-Type") {
            if !ct.eq_ignore_ascii_case("application/sdp") {
                return Some(SipResponse::to_request(request, 415, None));
            }
        }
        if request.body.trim().is_empty() {
            return Some(SipResponse::to_request(request, 400, None));
        }

        let offer = match SdpOffer::parse(&request.body) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "INVITE carried unparseable SDP");
                return Some(SipResponse::to_request(request, 400, None));
            }
        };

        match self.handler.on_invite(&call_id, &offer).await {
            InviteOutcome::Answer(answer) => {
                let tag = self
                    .call_tags
                    .entry(call_id.clone())
                    .or_insert_with(random_tag)
                    .clone();
                self.sent_responses.insert((call_id.clone(), 200));
                info!(call_id = %call_id, codec = %answer.codec.kind().name(), port = answer.local_port, "answering INVITE");
                Some(
                    SipResponse::to_request(request, 200, Some(&tag))
                        .contact(
                            &self.config.service_user,
                            &self.config.advertised_host,
                            self.config.bind_addr.port(),
                        )
                        .sdp_body(answer.to_sdp()),
                )
            }
            InviteOutcome::Reject(status) => {
                info!(call_id = %call_id, status, "rejecting INVITE");
                Some(SipResponse::to_request(request, status, None))
            }
        }
    }

    async fn handle_bye(&mut self, request: &SipRequest) -> Option<SipResponse> {
        let call_id = match request.call_id() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Some(SipResponse::to_request(request, 400, None)),
        };

        let known = self.handler.on_bye(&call_id).await;
        self.sent_responses.remove(&(call_id.clone(), 200));
        let tag = self.call_tags.remove(&call_id);

        if known {
            Some(SipResponse::to_request(request, 200, tag.as_deref()))
        } else {
            Some(SipResponse::to_request(request, 481, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use voxbridge_audio_core::{Codec, CodecKind};

    use crate::sdp::choose_codec;

    struct FakeEngine {
        live_calls: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl InviteHandler for FakeEngine {
        async fn on_invite(&self, call_id: &str, offer: &SdpOffer) -> InviteOutcome {
            match choose_codec(offer, &[CodecKind::Pcmu, CodecKind::Pcma, CodecKind::Opus]) {
                Ok(codec) => {
                    self.live_calls.lock().insert(call_id.to_string());
                    InviteOutcome::Answer(MediaAnswer {
                        advertised_ip: "127.0.0.1".into(),
                        local_port: 35002,
                        codec,
                    })
                }
                Err(_) => InviteOutcome::Reject(488),
            }
        }

        async fn on_bye(&self, call_id: &str) -> bool {
            self.live_calls.lock().remove(call_id)
        }
    }

    async fn start_backend() -> (SocketAddr, watch::Sender<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let config = SipBackendConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let backend = SipBackend::bind(
            config,
            Arc::new(FakeEngine { live_calls: Mutex::new(HashSet::new()) }),
            stop_rx,
        )
        .await
        .unwrap();
        let addr = backend.local_addr().unwrap();
        backend.spawn();
        (addr, stop_tx)
    }

    fn invite(call_id: &str, media_line: &str, rtpmap: &str) -> String {
        format!(
            "INVITE sip:bot@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1\r\n\
             From: <sip:switch@10.0.0.1>;tag=f1\r\n\
             To: <sip:bot@127.0.0.1>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Type: application/sdp\r\n\
             \r\n\
             v=0\r\n\
             o=- 1 1 IN IP4 10.0.0.1\r\n\
             s=call\r\n\
             c=IN IP4 10.0.0.1\r\n\
             t=0 0\r\n\
             {media_line}\r\n\
             {rtpmap}\r\n"
        )
    }

    async fn transact(addr: SocketAddr, request: &str) -> Option<String> {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sock.send_to(request.as_bytes(), addr).await.unwrap();
        let mut buf = vec![0u8; 16384];
        match tokio::time::timeout(Duration::from_millis(500), sock.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(String::from_utf8_lossy(&buf[..len]).into_owned()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn invite_answered_with_preferred_codec() {
        let (addr, _stop) = start_backend().await;
        let response = transact(
            addr,
            &invite("neg-1", "m=audio 40000 RTP/AVP 8 0 96", "a=rtpmap:96 opus/48000"),
        )
        .await
        .unwrap();

        assert!(response.starts_with("SIP/2.0 200 OK\r\n"));
        // PCMU wins on preference despite PCMA leading the offer
        assert!(response.contains("m=audio 35002 RTP/AVP 0\r\n"));
        assert!(response.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(response.contains("a=sendrecv\r\n"));
        assert!(response.contains("To: <sip:bot@127.0.0.1>;tag="));
        assert!(response.contains("Content-Type: application/sdp\r\n"));
    }

    #[tokio::test]
    async fn retransmitted_invite_is_suppressed() {
        let (addr, _stop) = start_backend().await;
        let message = invite("dup-1", "m=audio 40000 RTP/AVP 0", "a=rtpmap:0 PCMU/8000");

        let first = transact(addr, &message).await;
        assert!(first.is_some());
        let second = transact(addr, &message).await;
        assert!(second.is_none(), "duplicate INVITE must not get a second 200");
    }

    #[tokio::test]
    async fn codec_mismatch_gets_488() {
        let (addr, _stop) = start_backend().await;
        let response = transact(
            addr,
            &invite("mis-1", "m=audio 40000 RTP/AVP 18", "a=rtpmap:18 G729/8000"),
        )
        .await
        .unwrap();
        assert!(response.starts_with("SIP/2.0 488 Not Acceptable Here\r\n"));
    }

    #[tokio::test]
    async fn bad_sdp_gets_400() {
        let (addr, _stop) = start_backend().await;
        let message = "INVITE sip:bot@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
             From: <sip:a@b>;tag=1\r\n\
             To: <sip:c@d>\r\n\
             Call-ID: bad-1\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Type: application/sdp\r\n\
             \r\n\
             this is not sdp\r\n";
        let response = transact(addr, message).await.unwrap();
        assert!(response.starts_with("SIP/2.0 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn bye_for_live_and_unknown_calls() {
        let (addr, _stop) = start_backend().await;
        transact(addr, &invite("bye-1", "m=audio 40000 RTP/AVP 0", "a=rtpmap:0 PCMU/8000"))
            .await
            .unwrap();

        let bye = "BYE sip:bot@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
             From: <sip:a@b>;tag=1\r\n\
             To: <sip:c@d>;tag=2\r\n\
             Call-ID: bye-1\r\n\
             CSeq: 2 BYE\r\n\
             \r\n";
        let response = transact(addr, bye).await.unwrap();
        assert!(response.starts_with("SIP/2.0 200 OK\r\n"));

        // The call is gone now; a second BYE finds no transaction
        let response = transact(addr, bye).await.unwrap();
        assert!(response.starts_with("SIP/2.0 481 Call/Transaction Does Not Exist\r\n"));
    }

    #[tokio::test]
    async fn unsupported_method_gets_405() {
        let (addr, _stop) = start_backend().await;
        let message = "OPTIONS sip:bot@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
             From: <sip:a@b>;tag=1\r\n\
             To: <sip:c@d>\r\n\
             Call-ID: opt-1\r\n\
             CSeq: 1 OPTIONS\r\n\
             \r\n";
        let response = transact(addr, message).await.unwrap();
        assert!(response.starts_with("SIP/2.0 405 Method Not Allowed\r\n"));
    }
}

//! Per-call RTP transport tasks
//!
//! Two tasks share one bound socket per call:
//!
//! - [`RtpReceiver`] reads datagrams, validates RTP framing, re-learns the
//!   remote endpoint from the first packet's source address (NAT traversal)
//!   and hands payloads to the media pipeline.
//! - [`RtpSender`] runs the paced transmit loop: one packet per ptime, fed
//!   from the call's [`OutboundQueue`], with codec silence filling the gaps.
//!
//! Both tasks select on the call's stop signal and exit promptly when it
//! fires.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use voxbridge_audio_core::Codec;

use crate::packet::{RtpPacket, RTP_MIN_HEADER_SIZE};
use crate::queue::OutboundQueue;

/// Default receive buffer size for RTP datagrams
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 4096;

/// Packet and error counters shared across a call's transport tasks
#[derive(Debug, Default)]
pub struct RtpSessionStats {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    errors: AtomicU64,
}

impl RtpSessionStats {
    /// Packets accepted by the receiver
    pub fn packets_in(&self) -> u64 {
        self.packets_in.load(Ordering::Relaxed)
    }

    /// Packets emitted by the sender
    pub fn packets_out(&self) -> u64 {
        self.packets_out.load(Ordering::Relaxed)
    }

    /// Datagrams dropped for framing or source-address reasons
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Wait until the stop signal flips to true (or its sender goes away)
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

/// The receive half of a call's RTP transport
pub struct RtpReceiver {
    socket: Arc<UdpSocket>,
    paused: Arc<AtomicBool>,
    stop: watch::Receiver<bool>,
    /// Publishes the learned remote endpoint; `None` until the first packet
    remote_tx: watch::Sender<Option<SocketAddr>>,
    payload_tx: mpsc::Sender<Bytes>,
    stats: Arc<RtpSessionStats>,
    receive_buffer_size: usize,
}

impl RtpReceiver {
    /// Create a receiver for one call's socket.
    ///
    /// `remote_tx` starts at `None`; the first accepted packet's source
    /// address is published on it, which is what allows the sender to start.
    pub fn new(
        socket: Arc<UdpSocket>,
        paused: Arc<AtomicBool>,
        stop: watch::Receiver<bool>,
        remote_tx: watch::Sender<Option<SocketAddr>>,
        payload_tx: mpsc::Sender<Bytes>,
        stats: Arc<RtpSessionStats>,
    ) -> Self {
        Self {
            socket,
            paused,
            stop,
            remote_tx,
            payload_tx,
            stats,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
        }
    }

    /// Override the datagram buffer size
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size.max(RTP_MIN_HEADER_SIZE);
        self
    }

    /// Spawn the receive loop
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut buf = vec![0u8; self.receive_buffer_size];
        loop {
            let (len, src) = tokio::select! {
                _ = stopped(&mut self.stop) => break,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "RTP socket receive failed");
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                },
            };

            if len < RTP_MIN_HEADER_SIZE {
                debug!(len, "dropping short RTP datagram");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let packet = match RtpPacket::parse(&buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, len, "dropping unparseable RTP datagram");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let learned = *self.remote_tx.borrow();
            match learned {
                None => {
                    info!(remote = %src, "learned RTP remote endpoint from first packet");
                    let _ = self.remote_tx.send(Some(src));
                }
                Some(expected) if expected != src => {
                    warn!(expected = %expected, got = %src, "dropping RTP from unexpected source");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Some(_) => {}
            }

            self.stats.packets_in.fetch_add(1, Ordering::Relaxed);

            if self.paused.load(Ordering::Relaxed) {
                continue;
            }

            if self.payload_tx.send(packet.payload).await.is_err() {
                debug!("payload channel closed, stopping RTP receiver");
                break;
            }
        }
        debug!("RTP receiver finished");
    }
}

/// Configuration for the paced sender
#[derive(Debug, Clone)]
pub struct RtpSenderConfig {
    /// Negotiated codec, providing payload type, ptime and silence frames
    pub codec: Codec,
}

impl RtpSenderConfig {
    /// Standard configuration for a codec
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }
}

/// The paced transmit half of a call's RTP transport
pub struct RtpSender {
    socket: Arc<UdpSocket>,
    config: RtpSenderConfig,
    queue: OutboundQueue,
    paused: Arc<AtomicBool>,
    stop: watch::Receiver<bool>,
    remote_rx: watch::Receiver<Option<SocketAddr>>,
    stats: Arc<RtpSessionStats>,
}

impl RtpSender {
    /// Create the sender for one call
    pub fn new(
        socket: Arc<UdpSocket>,
        config: RtpSenderConfig,
        queue: OutboundQueue,
        paused: Arc<AtomicBool>,
        stop: watch::Receiver<bool>,
        remote_rx: watch::Receiver<Option<SocketAddr>>,
        stats: Arc<RtpSessionStats>,
    ) -> Self {
        Self { socket, config, queue, paused, stop, remote_rx, stats }
    }

    /// Spawn the paced send loop
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        // The sender cannot transmit until the receiver has learned where the
        // far end actually is (SDP addresses lie behind NAT).
        let remote = tokio::select! {
            _ = stopped(&mut self.stop) => return,
            res = self.remote_rx.wait_for(|r| r.is_some()) => match res {
                Ok(guard) => match *guard {
                    Some(addr) => addr,
                    None => return,
                },
                Err(_) => return,
            },
        };
        info!(remote = %remote, "RTP sender starting paced loop");

        let mut sequence: u16 = rand::random();
        let mut timestamp: u32 = rand::random();
        let ssrc: u32 = rand::random();

        let codec = &self.config.codec;
        let payload_type = codec.payload_type();
        let ts_increment = codec.ts_increment();
        let ptime = Duration::from_millis(codec.ptime_ms() as u64);

        // Marker handling: the first packet of each talk spurt is marked, and
        // a silence gap ends the current spurt.
        let mut in_spurt = false;
        let mut first_packet = true;

        let start = tokio::time::Instant::now();
        let mut packet_no: u64 = 0;

        loop {
            if *self.stop.borrow() {
                break;
            }

            let popped = tokio::select! {
                _ = stopped(&mut self.stop) => break,
                p = self.queue.pop_timeout(ptime) => p,
            };

            let (payload, is_real) = match popped {
                Some(p) => (Some(p), true),
                None if !self.paused.load(Ordering::Relaxed) => {
                    (Some(Bytes::from(codec.silence_frame())), false)
                }
                None => (None, false),
            };

            if let Some(payload) = payload {
                let marker = if is_real { !in_spurt } else { first_packet };
                let mut packet = RtpPacket::with_payload(payload_type, sequence, timestamp, ssrc, payload);
                packet.header.marker = marker;

                // Destination can move if the far end re-learns mid-call.
                let target = (*self.remote_rx.borrow()).unwrap_or(remote);
                match packet.serialize() {
                    Ok(wire) => {
                        if let Err(e) = self.socket.send_to(&wire, target).await {
                            warn!(error = %e, target = %target, "RTP send failed");
                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                        } else {
                            self.stats.packets_out.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to serialize RTP packet");
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }

                sequence = sequence.wrapping_add(1);
                in_spurt = is_real;
                first_packet = false;
            }

            timestamp = timestamp.wrapping_add(ts_increment);
            packet_no += 1;

            // Anti-drift pacing: wake at start + n * ptime instead of
            // sleeping a relative ptime per iteration.
            let next = start + Duration::from_millis(codec.ptime_ms() as u64 * packet_no);
            tokio::select! {
                _ = stopped(&mut self.stop) => break,
                _ = tokio::time::sleep_until(next) => {}
            }
        }
        debug!("RTP sender finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxbridge_audio_core::g711::PCMU_SILENCE;

    async fn udp_pair() -> (Arc<UdpSocket>, Arc<UdpSocket>) {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        (a, b)
    }

    fn spawn_sender(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        queue: OutboundQueue,
        stop: watch::Receiver<bool>,
        stats: Arc<RtpSessionStats>,
    ) -> (JoinHandle<()>, watch::Sender<Option<SocketAddr>>) {
        let (remote_tx, remote_rx) = watch::channel(Some(remote));
        let handle = RtpSender::new(
            socket,
            RtpSenderConfig::new(Codec::pcmu()),
            queue,
            Arc::new(AtomicBool::new(false)),
            stop,
            remote_rx,
            stats,
        )
        .spawn();
        (handle, remote_tx)
    }

    #[tokio::test]
    async fn sender_emits_contiguous_sequence_and_timestamps() {
        let (send_sock, recv_sock) = udp_pair().await;
        let remote = recv_sock.local_addr().unwrap();
        let queue = OutboundQueue::new(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let stats = Arc::new(RtpSessionStats::default());

        for i in 0u8..5 {
            queue.push(Bytes::from(vec![i; 160])).await;
        }
        let (handle, _remote_tx) = spawn_sender(send_sock, remote, queue, stop_rx, stats.clone());

        let mut buf = [0u8; 2048];
        let mut packets = Vec::new();
        for _ in 0..8 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), recv_sock.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            packets.push(RtpPacket::parse(&buf[..len]).unwrap());
        }
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        // Marker only on the first packet; seq strictly +1; ts +160 per packet
        assert!(packets[0].header.marker);
        for pair in packets.windows(2) {
            assert_eq!(pair[1].header.sequence_number, pair[0].header.sequence_number.wrapping_add(1));
            assert_eq!(pair[1].header.timestamp, pair[0].header.timestamp.wrapping_add(160));
            assert_eq!(pair[1].header.ssrc, pair[0].header.ssrc);
            assert!(!pair[1].header.marker);
        }
        // The five queued payloads go out first, then silence fill
        assert_eq!(&packets[0].payload[..], &[0u8; 160][..]);
        assert!(packets[6].payload.iter().all(|&b| b == PCMU_SILENCE));
        assert!(stats.packets_out() >= 8);
    }

    #[tokio::test]
    async fn sender_marks_new_spurt_after_silence() {
        let (send_sock, recv_sock) = udp_pair().await;
        let remote = recv_sock.local_addr().unwrap();
        let queue = OutboundQueue::new(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let stats = Arc::new(RtpSessionStats::default());

        queue.push(Bytes::from(vec![1u8; 160])).await;
        let (handle, _remote_tx) = spawn_sender(send_sock, remote, queue.clone(), stop_rx, stats);

        let mut buf = [0u8; 2048];
        // Talk spurt of one packet, then a couple of silence frames
        let mut saw_silence = false;
        for _ in 0..4 {
            let (len, _) = recv_sock.recv_from(&mut buf).await.unwrap();
            let p = RtpPacket::parse(&buf[..len]).unwrap();
            if p.payload.iter().all(|&b| b == PCMU_SILENCE) {
                saw_silence = true;
            }
        }
        assert!(saw_silence);

        // New audio after the gap starts a fresh spurt with the marker set
        queue.push(Bytes::from(vec![2u8; 160])).await;
        let marked = loop {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), recv_sock.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let p = RtpPacket::parse(&buf[..len]).unwrap();
            if p.payload.iter().all(|&b| b == 2) {
                break p.header.marker;
            }
        };
        assert!(marked);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn receiver_learns_remote_and_filters_sources() {
        let (call_sock, peer_sock) = udp_pair().await;
        let call_addr = call_sock.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (remote_tx, mut remote_rx) = watch::channel(None);
        let (payload_tx, mut payload_rx) = mpsc::channel(16);
        let stats = Arc::new(RtpSessionStats::default());

        let handle = RtpReceiver::new(
            call_sock,
            Arc::new(AtomicBool::new(false)),
            stop_rx,
            remote_tx,
            payload_tx,
            stats.clone(),
        )
        .spawn();

        let packet = RtpPacket::with_payload(0, 1, 160, 42, Bytes::from(vec![0xAAu8; 160]));
        peer_sock.send_to(&packet.serialize().unwrap(), call_addr).await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), payload_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.len(), 160);

        // Remote endpoint was learned from the packet source
        remote_rx.wait_for(|r| r.is_some()).await.unwrap();
        assert_eq!(*remote_rx.borrow(), Some(peer_sock.local_addr().unwrap()));

        // A different source is dropped
        let imposter = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        imposter.send_to(&packet.serialize().unwrap(), call_addr).await.unwrap();
        // And short datagrams are dropped too
        peer_sock.send_to(&[0x80u8; 11], call_addr).await.unwrap();

        let more = tokio::time::timeout(Duration::from_millis(200), payload_rx.recv()).await;
        assert!(more.is_err(), "imposter or short datagram leaked through");

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(stats.packets_in(), 1);
        assert!(stats.errors() >= 2);
    }

    #[tokio::test]
    async fn paused_receiver_drops_payloads() {
        let (call_sock, peer_sock) = udp_pair().await;
        let call_addr = call_sock.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (remote_tx, _remote_rx) = watch::channel(None);
        let (payload_tx, mut payload_rx) = mpsc::channel(16);
        let paused = Arc::new(AtomicBool::new(true));

        let handle = RtpReceiver::new(
            call_sock,
            paused,
            stop_rx,
            remote_tx,
            payload_tx,
            Arc::new(RtpSessionStats::default()),
        )
        .spawn();

        let packet = RtpPacket::with_payload(0, 1, 160, 42, Bytes::from(vec![0u8; 160]));
        peer_sock.send_to(&packet.serialize().unwrap(), call_addr).await.unwrap();

        let got = tokio::time::timeout(Duration::from_millis(200), payload_rx.recv()).await;
        assert!(got.is_err());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}

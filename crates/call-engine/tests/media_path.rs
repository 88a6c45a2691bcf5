//! Full-stack media path test: INVITE over UDP, RTP in, paced RTP out, BYE.
//!
//! Exercises the whole wiring without external speech services: the SIP
//! backend answers with a negotiated codec and a pooled port, the receiver
//! learns the remote endpoint from the first RTP packet, and the paced
//! sender keeps a contiguous, correctly-timestamped stream flowing back.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use voxbridge_audio_core::{g711, metrics};
use voxbridge_call_engine::adapters::{NullSttEngine, ToneTtsEngine};
use voxbridge_call_engine::{CallEngine, EngineConfig};
use voxbridge_media_core::EchoResponder;
use voxbridge_rtp_core::RtpPacket;
use voxbridge_sip_core::{SdpOffer, SipBackend, SipBackendConfig};

fn engine_on_localhost(min_port: u16, max_port: u16) -> Arc<CallEngine> {
    let mut config = EngineConfig::default();
    config.rtp.bind_ip = "127.0.0.1".parse().unwrap();
    config.rtp.min_port = min_port;
    config.rtp.max_port = max_port;
    config.sip.advertised_ip = "127.0.0.1".into();
    CallEngine::new(
        config,
        Arc::new(NullSttEngine),
        Arc::new(ToneTtsEngine::default()),
        Arc::new(EchoResponder),
    )
}

fn invite(call_id: &str) -> String {
    format!(
        "INVITE sip:bot@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKtest\r\n\
         From: <sip:switch@127.0.0.1>;tag=sw1\r\n\
         To: <sip:bot@127.0.0.1>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Type: application/sdp\r\n\
         \r\n\
         v=0\r\n\
         o=- 7 7 IN IP4 127.0.0.1\r\n\
         s=call\r\n\
         c=IN IP4 127.0.0.1\r\n\
         t=0 0\r\n\
         m=audio 40000 RTP/AVP 8 0 96\r\n\
         a=rtpmap:96 opus/48000\r\n\
         a=sendrecv\r\n"
    )
}

fn bye(call_id: &str) -> String {
    format!(
        "BYE sip:bot@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKbye\r\n\
         From: <sip:switch@127.0.0.1>;tag=sw1\r\n\
         To: <sip:bot@127.0.0.1>;tag=b1\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 2 BYE\r\n\
         \r\n"
    )
}

/// 20 ms of a 440 Hz tone as a PCMU payload
fn tone_payload(seq: u16) -> Vec<u8> {
    let samples: Vec<i16> = (0..160)
        .map(|n| {
            let t = (seq as usize * 160 + n) as f32 / 8000.0;
            ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 16000.0) as i16
        })
        .collect();
    let packet = RtpPacket::with_payload(
        0,
        seq,
        (seq as u32) * 160,
        0x5151_5151,
        bytes::Bytes::from(g711::pcm16_to_pcmu(&samples)),
    );
    packet.serialize().unwrap().to_vec()
}

#[tokio::test]
async fn invite_rtp_and_bye_round_trip() {
    let engine = engine_on_localhost(42000, 42009);

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let backend = SipBackend::bind(
        SipBackendConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            advertised_host: "127.0.0.1".into(),
            ..Default::default()
        },
        engine.clone(),
        stop_rx,
    )
    .await
    .unwrap();
    let sip_addr = backend.local_addr().unwrap();
    backend.spawn();

    // --- INVITE / 200 OK ---
    let switch = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    switch.send_to(invite("media-1").as_bytes(), sip_addr).await.unwrap();

    let mut buf = vec![0u8; 16384];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), switch.recv_from(&mut buf))
        .await
        .expect("no 200 OK within 2s")
        .unwrap();
    let response = String::from_utf8_lossy(&buf[..len]).into_owned();
    assert!(response.starts_with("SIP/2.0 200 OK\r\n"), "response was: {response}");
    // PCMU wins the negotiation despite PCMA leading the offer
    assert!(response.contains("a=rtpmap:0 PCMU/8000\r\n"));
    assert!(response.contains("a=sendrecv\r\n"));

    let sdp = response.split("\r\n\r\n").nth(1).expect("200 OK carries SDP");
    let answer = SdpOffer::parse(sdp).unwrap();
    assert!((42000..=42009).contains(&answer.media_port));

    // --- RTP towards the call; the first packet teaches it our address ---
    let media = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let call_media_addr: std::net::SocketAddr =
        format!("127.0.0.1:{}", answer.media_port).parse().unwrap();

    for seq in 0u16..50 {
        media.send_to(&tone_payload(seq), call_media_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // --- The paced sender streams back to the learned endpoint ---
    let mut packets = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while packets.len() < 20 && tokio::time::Instant::now() < deadline {
        let Ok(Ok((len, from))) =
            tokio::time::timeout(Duration::from_millis(500), media.recv_from(&mut buf)).await
        else {
            continue;
        };
        assert_eq!(from, call_media_addr);
        packets.push(RtpPacket::parse(&buf[..len]).unwrap());
    }
    assert!(packets.len() >= 20, "only {} RTP packets came back", packets.len());

    // First packet of the stream carries the marker; sequence numbers are
    // strictly contiguous and timestamps advance one frame per packet.
    assert!(packets[0].header.marker);
    for pair in packets.windows(2) {
        assert_eq!(
            pair[1].header.sequence_number,
            pair[0].header.sequence_number.wrapping_add(1)
        );
        assert_eq!(pair[1].header.timestamp, pair[0].header.timestamp.wrapping_add(160));
        assert_eq!(pair[1].header.ssrc, pair[0].header.ssrc);
    }
    // With no recognizer wired in, the return stream is comfort silence
    for packet in &packets {
        assert_eq!(packet.header.payload_type, 0);
        assert_eq!(packet.payload.len(), 160);
        let decoded = g711::pcmu_to_pcm16(&packet.payload);
        assert!(metrics::audio_level(&decoded) < 0.01);
    }

    // --- BYE tears the call down and frees the port ---
    assert_eq!(engine.active_calls(), 1);
    switch.send_to(bye("media-1").as_bytes(), sip_addr).await.unwrap();
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), switch.recv_from(&mut buf))
        .await
        .expect("no BYE response")
        .unwrap();
    assert!(String::from_utf8_lossy(&buf[..len]).starts_with("SIP/2.0 200 OK\r\n"));

    // Registry empties and the pool slot is reusable within a second
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while engine.active_calls() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(engine.active_calls(), 0);

    switch.send_to(invite("media-2").as_bytes(), sip_addr).await.unwrap();
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), switch.recv_from(&mut buf))
        .await
        .expect("no 200 OK for the follow-up call")
        .unwrap();
    assert!(String::from_utf8_lossy(&buf[..len]).starts_with("SIP/2.0 200 OK\r\n"));
    assert_eq!(engine.active_calls(), 1);

    engine.shutdown().await;
    stop_tx.send(true).unwrap();
}

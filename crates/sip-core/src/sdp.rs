//! SDP offer parsing and answer generation
//!
//! The connector consumes the offer inside an INVITE (connection address,
//! audio port, payload type list, `a=rtpmap`/`a=fmtp` attributes), picks one
//! codec from the intersection with its own support, and produces the answer
//! SDP for the 200 OK.

use std::collections::HashMap;
use std::fmt::Write as _;

use voxbridge_audio_core::{Codec, CodecKind};

use crate::error::{Error, Result};

/// An `a=rtpmap` entry from the offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    /// Encoding name as offered (case preserved)
    pub name: String,
    /// Clock rate in Hz
    pub clock_rate: u32,
}

/// The parts of an SDP offer the connector acts on
#[derive(Debug, Clone)]
pub struct SdpOffer {
    /// Session- or media-level connection address (`c=IN IP4 <ip>`)
    pub connection_ip: Option<String>,
    /// Offered audio port from `m=audio`
    pub media_port: u16,
    /// Payload types listed on the `m=audio` line, in offer order
    pub payload_types: Vec<u8>,
    /// `a=rtpmap` attributes keyed by payload type
    pub rtpmaps: HashMap<u8, RtpMap>,
    /// `a=fmtp` parameter strings keyed by payload type
    pub fmtp: HashMap<u8, String>,
}

impl SdpOffer {
    /// Parse an SDP body.
    ///
    /// Lines other than `c=`, `m=audio`, `a=rtpmap` and `a=fmtp` are
    /// ignored; a missing `m=audio` line is an error.
    pub fn parse(body: &str) -> Result<Self> {
        let mut connection_ip = None;
        let mut media_port = None;
        let mut payload_types = Vec::new();
        let mut rtpmaps = HashMap::new();
        let mut fmtp = HashMap::new();

        for raw in body.lines() {
            let line = raw.trim();
            if let Some(rest) = line.strip_prefix("c=") {
                // c=IN IP4 192.168.88.1
                let mut parts = rest.split_whitespace();
                if parts.next() == Some("IN") {
                    let _family = parts.next();
                    if let Some(ip) = parts.next() {
                        connection_ip = Some(ip.to_string());
                    }
                }
            } else if let Some(rest) = line.strip_prefix("m=audio ") {
                // m=audio 40000 RTP/AVP 8 0 96
                let mut parts = rest.split_whitespace();
                media_port = parts
                    .next()
                    .and_then(|p| p.parse::<u16>().ok());
                let _proto = parts.next();
                for pt in parts {
                    if let Ok(pt) = pt.parse::<u8>() {
                        payload_types.push(pt);
                    }
                }
            } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
                // a=rtpmap:96 opus/48000/2
                if let Some((pt, spec)) = rest.split_once(' ') {
                    if let Ok(pt) = pt.trim().parse::<u8>() {
                        let mut spec_parts = spec.trim().split('/');
                        let name = spec_parts.next().unwrap_or_default().to_string();
                        let clock_rate = spec_parts
                            .next()
                            .and_then(|r| r.parse::<u32>().ok())
                            .unwrap_or(8000);
                        rtpmaps.insert(pt, RtpMap { name, clock_rate });
                    }
                }
            } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
                // a=fmtp:96 sprop-maxcapturerate=16000;useinbandfec=1
                if let Some((pt, params)) = rest.split_once(' ') {
                    if let Ok(pt) = pt.trim().parse::<u8>() {
                        fmtp.insert(pt, params.trim().to_string());
                    }
                }
            }
        }

        let media_port =
            media_port.ok_or_else(|| Error::MalformedSdp("no m=audio line".into()))?;
        if payload_types.is_empty() {
            return Err(Error::MalformedSdp("m=audio offers no payload types".into()));
        }

        Ok(Self { connection_ip, media_port, payload_types, rtpmaps, fmtp })
    }

    /// `sprop-maxcapturerate` from the fmtp line of a payload type
    fn sprop_max_capture_rate(&self, pt: u8) -> Option<u32> {
        self.fmtp.get(&pt)?.split(';').find_map(|kv| {
            let (key, value) = kv.trim().split_once('=')?;
            if key.eq_ignore_ascii_case("sprop-maxcapturerate") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
    }

    /// Payload types in the offer matching a codec family
    fn offered_payload_type(&self, kind: CodecKind) -> Option<u8> {
        match kind {
            CodecKind::Pcmu => self
                .payload_types
                .iter()
                .copied()
                .find(|&pt| pt == 0 || self.rtpmap_is(pt, "PCMU")),
            CodecKind::Pcma => self
                .payload_types
                .iter()
                .copied()
                .find(|&pt| pt == 8 || self.rtpmap_is(pt, "PCMA")),
            CodecKind::Opus => self
                .payload_types
                .iter()
                .copied()
                .find(|&pt| self.rtpmap_is(pt, "opus")),
        }
    }

    fn rtpmap_is(&self, pt: u8, name: &str) -> bool {
        self.rtpmaps
            .get(&pt)
            .map(|m| m.name.eq_ignore_ascii_case(name))
            .unwrap_or(false)
    }
}

/// Pick one codec from the offer following the preference order.
///
/// Returns [`Error::NoSupportedCodec`] when the intersection is empty, which
/// the backend maps to a 488.
pub fn choose_codec(offer: &SdpOffer, preference: &[CodecKind]) -> Result<Codec> {
    for kind in preference {
        if let Some(pt) = offer.offered_payload_type(*kind) {
            let codec = match kind {
                CodecKind::Pcmu => Codec::pcmu(),
                CodecKind::Pcma => Codec::pcma(),
                CodecKind::Opus => Codec::opus(pt, offer.sprop_max_capture_rate(pt)),
            };
            return Ok(codec);
        }
    }
    Err(Error::NoSupportedCodec)
}

/// The media answer the connector advertises in its 200 OK
#[derive(Debug, Clone)]
pub struct MediaAnswer {
    /// IP advertised in the origin and connection lines
    pub advertised_ip: String,
    /// Locally-bound RTP port
    pub local_port: u16,
    /// The negotiated codec
    pub codec: Codec,
}

impl MediaAnswer {
    /// Render the answer SDP
    pub fn to_sdp(&self) -> String {
        let session_id: u32 = rand::random::<u32>() | 1;
        let mut sdp = String::new();
        let _ = write!(sdp, "v=0\r\n");
        let _ = write!(
            sdp,
            "o=voxbridge {session_id} {session_id} IN IP4 {}\r\n",
            self.advertised_ip
        );
        let _ = write!(sdp, "s=voxbridge media\r\n");
        let _ = write!(sdp, "c=IN IP4 {}\r\n", self.advertised_ip);
        let _ = write!(sdp, "t=0 0\r\n");
        let _ = write!(
            sdp,
            "m=audio {} RTP/AVP {}\r\n",
            self.local_port,
            self.codec.payload_type()
        );
        let _ = write!(
            sdp,
            "a=rtpmap:{} {}/{}\r\n",
            self.codec.payload_type(),
            self.codec.kind().name(),
            self.codec.clock_rate()
        );
        let _ = write!(sdp, "a=ptime:{}\r\n", self.codec.ptime_ms());
        let _ = write!(sdp, "a=sendrecv\r\n");
        sdp
    }
}

//! RTP packet encoding and decoding per RFC 3550

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::Error;
use crate::{Result, RtpCsrc, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version (always 2 in practice)
pub const RTP_VERSION: u8 = 2;

/// Minimum header size (without CSRC or extensions)
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// RTP fixed header, RFC 3550 §5.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (should be 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// CSRC count (number of contributing sources)
    pub cc: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type
    pub payload_type: u8,
    /// Sequence number
    pub sequence_number: RtpSequenceNumber,
    /// Timestamp
    pub timestamp: RtpTimestamp,
    /// Synchronization source identifier
    pub ssrc: RtpSsrc,
    /// Contributing source identifiers
    pub csrc: Vec<RtpCsrc>,
    /// Extension header ID
    pub extension_id: Option<u16>,
    /// Extension data
    pub extension_data: Option<Bytes>,
}

impl RtpHeader {
    /// Create a new header with the usual defaults
    pub fn new(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            cc: 0,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension_id: None,
            extension_data: None,
        }
    }

    /// Size of the serialized header in bytes
    pub fn size(&self) -> usize {
        let mut size = RTP_MIN_HEADER_SIZE + self.csrc.len() * 4;
        if self.extension {
            size += 4;
            if let Some(ext) = &self.extension_data {
                size += (ext.len() + 3) / 4 * 4;
            }
        }
        size
    }

    /// Parse a header from the start of `data`, returning the header and the
    /// number of bytes it consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RTP_MIN_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_MIN_HEADER_SIZE,
                available: data.len(),
            });
        }

        // First byte: V(2) P(1) X(1) CC(4)
        let version = (data[0] >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(Error::InvalidPacket(format!("invalid RTP version: {}", version)));
        }
        let padding = (data[0] & 0x20) != 0;
        let extension = (data[0] & 0x10) != 0;
        let cc = data[0] & 0x0F;

        // Second byte: M(1) PT(7)
        let marker = (data[1] & 0x80) != 0;
        let payload_type = data[1] & 0x7F;

        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_MIN_HEADER_SIZE;

        let mut csrc = Vec::with_capacity(cc as usize);
        for _ in 0..cc {
            if data.len() < offset + 4 {
                return Err(Error::BufferTooSmall { required: offset + 4, available: data.len() });
            }
            csrc.push(u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]));
            offset += 4;
        }

        let (extension_id, extension_data) = if extension {
            if data.len() < offset + 4 {
                return Err(Error::BufferTooSmall { required: offset + 4, available: data.len() });
            }
            let ext_id = u16::from_be_bytes([data[offset], data[offset + 1]]);
            // Extension length counts 32-bit words following the 4-byte
            // extension header.
            let ext_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize * 4;
            offset += 4;
            if data.len() < offset + ext_len {
                return Err(Error::BufferTooSmall {
                    required: offset + ext_len,
                    available: data.len(),
                });
            }
            let ext_data = Bytes::copy_from_slice(&data[offset..offset + ext_len]);
            offset += ext_len;
            (Some(ext_id), Some(ext_data))
        } else {
            (None, None)
        };

        Ok((
            Self {
                version,
                padding,
                extension,
                cc,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
                csrc,
                extension_id,
                extension_data,
            },
            offset,
        ))
    }

    /// Serialize the header into `buf`
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.size());

        let mut first = (self.version & 0x03) << 6;
        if self.padding {
            first |= 0x20;
        }
        if self.extension {
            first |= 0x10;
        }
        first |= self.cc & 0x0F;
        buf.put_u8(first);

        let mut second = self.payload_type & 0x7F;
        if self.marker {
            second |= 0x80;
        }
        buf.put_u8(second);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        if self.cc as usize != self.csrc.len() {
            return Err(Error::InvalidParameter(format!(
                "CSRC count ({}) does not match CSRC list length ({})",
                self.cc,
                self.csrc.len()
            )));
        }
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if self.extension {
            let ext_data = self.extension_data.as_ref().ok_or_else(|| {
                Error::InvalidParameter("extension flag set but no extension data".to_string())
            })?;
            buf.put_u16(self.extension_id.unwrap_or(0));
            let words = (ext_data.len() + 3) / 4;
            buf.put_u16(words as u16);
            buf.put_slice(ext_data);
            for _ in 0..(words * 4 - ext_data.len()) {
                buf.put_u8(0);
            }
        }

        Ok(())
    }
}

/// A parsed RTP packet: header plus payload with padding stripped
#[derive(Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// RTP header
    pub header: RtpHeader,
    /// Payload data (padding removed)
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a packet from a header and payload
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Build a packet from the basic field set
    pub fn with_payload(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
        payload: Bytes,
    ) -> Self {
        Self { header: RtpHeader::new(payload_type, sequence_number, timestamp, ssrc), payload }
    }

    /// Total serialized size in bytes
    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len()
    }

    /// Parse a datagram into a packet.
    ///
    /// A 12-byte datagram is a valid packet with an empty payload. Padding
    /// declared by the header is removed from the payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (header, header_len) = RtpHeader::parse(data)?;
        let mut payload = &data[header_len..];

        if header.padding && !payload.is_empty() {
            let pad = payload.last().copied().unwrap_or(0) as usize;
            if pad == 0 || pad > payload.len() {
                return Err(Error::InvalidPacket(format!(
                    "padding length {} exceeds payload of {} bytes",
                    pad,
                    payload.len()
                )));
            }
            payload = &payload[..payload.len() - pad];
        }

        Ok(Self { header, payload: Bytes::copy_from_slice(payload) })
    }

    /// Serialize the packet to wire bytes.
    ///
    /// The padding bit is normalized away: payloads are emitted unpadded.
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        let mut header = self.header.clone();
        header.padding = false;
        header.serialize(&mut buf)?;
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

impl fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpPacket")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> RtpPacket {
        RtpPacket::with_payload(0, 0x1234, 0x5678_9ABC, 0xDEAD_BEEF, Bytes::from_static(&[0x80, 0x01, 0x02, 0x03]))
    }

    #[test]
    fn serialize_parse_round_trip() {
        let packet = sample_packet();
        let wire = packet.serialize().unwrap();
        assert_eq!(wire.len(), 16);
        assert_eq!(wire[0], 0x80); // version 2, no flags
        assert_eq!(wire[2], 0x12);
        assert_eq!(wire[3], 0x34);

        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed, packet);
        // A second serialize yields identical bytes
        assert_eq!(parsed.serialize().unwrap(), wire);
    }

    #[test]
    fn marker_bit_encodes() {
        let mut packet = sample_packet();
        packet.header.marker = true;
        let wire = packet.serialize().unwrap();
        assert_eq!(wire[1], 0x80);
        assert!(RtpPacket::parse(&wire).unwrap().header.marker);
    }

    #[test]
    fn exactly_twelve_bytes_is_empty_payload() {
        let header_only = RtpPacket::with_payload(0, 1, 2, 3, Bytes::new());
        let wire = header_only.serialize().unwrap();
        assert_eq!(wire.len(), 12);
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn eleven_bytes_is_rejected() {
        let err = RtpPacket::parse(&[0x80; 11]).unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall { required: 12, available: 11 }));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut wire = sample_packet().serialize().unwrap().to_vec();
        wire[0] = (1 << 6) | (wire[0] & 0x3F);
        assert!(matches!(RtpPacket::parse(&wire), Err(Error::InvalidPacket(_))));
    }

    #[test]
    fn padding_is_stripped_and_normalized() {
        // Hand-build a padded packet: 4 payload bytes + 4 padding bytes, the
        // last of which carries the padding length.
        let mut wire = BytesMut::new();
        let mut header = RtpHeader::new(0, 10, 20, 30);
        header.padding = true;
        header.serialize(&mut wire).unwrap();
        wire.put_slice(&[1, 2, 3, 4]);
        wire.put_slice(&[0, 0, 0, 4]);

        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(&parsed.payload[..], &[1, 2, 3, 4]);
        assert!(parsed.header.padding);

        // Re-serializing drops the padding but keeps everything else
        let rewire = parsed.serialize().unwrap();
        let reparsed = RtpPacket::parse(&rewire).unwrap();
        assert_eq!(&reparsed.payload[..], &[1, 2, 3, 4]);
        assert!(!reparsed.header.padding);
    }

    #[test]
    fn bogus_padding_length_is_rejected() {
        let mut wire = BytesMut::new();
        let mut header = RtpHeader::new(0, 10, 20, 30);
        header.padding = true;
        header.serialize(&mut wire).unwrap();
        wire.put_slice(&[0, 0, 9]); // claims 9 bytes of padding in a 3-byte payload
        assert!(matches!(RtpPacket::parse(&wire), Err(Error::InvalidPacket(_))));
    }

    #[test]
    fn csrc_list_round_trip() {
        let mut packet = sample_packet();
        packet.header.cc = 2;
        packet.header.csrc = vec![0x1111_1111, 0x2222_2222];
        let wire = packet.serialize().unwrap();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.header.csrc, packet.header.csrc);
        assert_eq!(parsed.payload, packet.payload);
    }

    #[test]
    fn csrc_mismatch_fails_serialize() {
        let mut packet = sample_packet();
        packet.header.cc = 3;
        assert!(matches!(packet.serialize(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn extension_round_trip() {
        let mut packet = sample_packet();
        packet.header.extension = true;
        packet.header.extension_id = Some(0xBEDE);
        packet.header.extension_data = Some(Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]));
        let wire = packet.serialize().unwrap();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.header.extension_id, Some(0xBEDE));
        assert_eq!(parsed.header.extension_data.as_deref(), Some(&[1u8, 2, 3, 4, 5, 6, 7, 8][..]));
        assert_eq!(parsed.payload, packet.payload);
    }
}

//! Error types for rtp-core

use thiserror::Error;

/// Errors produced by the RTP transport
#[derive(Debug, Error)]
pub enum Error {
    /// A datagram was shorter than the structure being parsed
    #[error("buffer too small: needed {required} bytes, had {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// The packet violated RFC 3550 framing
    #[error("invalid RTP packet: {0}")]
    InvalidPacket(String),

    /// A field combination could not be serialized
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Every port in the configured range is in use
    #[error("no available RTP ports in {min}..={max}")]
    NoAvailablePorts { min: u16, max: u16 },

    /// Socket-level failure
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Result alias for rtp-core operations
pub type Result<T> = std::result::Result<T, Error>;

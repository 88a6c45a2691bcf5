//! Error types for sip-core

use thiserror::Error;

/// Errors produced by the signalling layer
#[derive(Debug, Error)]
pub enum Error {
    /// A SIP message could not be parsed
    #[error("malformed SIP message: {0}")]
    MalformedMessage(String),

    /// An SDP body could not be parsed
    #[error("malformed SDP: {0}")]
    MalformedSdp(String),

    /// A switch event datagram could not be interpreted
    #[error("unparseable switch event: {0}")]
    UnparseableEvent(String),

    /// The offer carried no codec the connector supports
    #[error("no mutually supported codec in offer")]
    NoSupportedCodec,

    /// Socket-level failure
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Result alias for sip-core operations
pub type Result<T> = std::result::Result<T, Error>;

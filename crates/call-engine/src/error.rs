//! Error types for call-engine

use thiserror::Error;

/// Errors produced by call orchestration
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or validated
    #[error("configuration error: {0}")]
    Config(String),

    /// A scenario failed validation before execution
    #[error("invalid scenario: {0}")]
    ScenarioValidation(String),

    /// A call id was not found in the registry
    #[error("unknown call: {0}")]
    UnknownCall(String),

    /// A call with this id already exists
    #[error("call already exists: {0}")]
    DuplicateCall(String),

    /// RTP transport failure (includes port exhaustion)
    #[error(transparent)]
    Rtp(#[from] voxbridge_rtp_core::Error),

    /// Signalling failure
    #[error(transparent)]
    Sip(#[from] voxbridge_sip_core::Error),

    /// Speech machinery failure
    #[error(transparent)]
    Media(#[from] voxbridge_media_core::Error),

    /// Audio conversion failure
    #[error(transparent)]
    Audio(#[from] voxbridge_audio_core::Error),

    /// Filesystem or socket failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for call-engine operations
pub type Result<T> = std::result::Result<T, Error>;

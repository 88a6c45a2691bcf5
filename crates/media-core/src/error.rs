//! Error types for media-core

use thiserror::Error;

/// Errors produced by the speech machinery
#[derive(Debug, Error)]
pub enum Error {
    /// The STT service connection is gone (distinguished so the session can
    /// drive its reconnect policy)
    #[error("STT stream disconnected: {0}")]
    SttDisconnected(String),

    /// The STT service sent something other than a transcript message
    #[error("malformed STT message: {0}")]
    MalformedTranscript(String),

    /// STT reconnect attempts were exhausted
    #[error("STT reconnect failed after {attempts} attempts")]
    SttReconnectExhausted { attempts: u32 },

    /// TTS synthesis failed
    #[error("TTS synthesis failed: {0}")]
    TtsFailed(String),

    /// Response generation failed
    #[error("responder failed: {0}")]
    ResponderFailed(String),

    /// Audio conversion failed inside the pipeline
    #[error(transparent)]
    Audio(#[from] voxbridge_audio_core::Error),

    /// The session was asked to operate after its stop signal fired
    #[error("session is stopping")]
    Stopping,
}

/// Result alias for media-core operations
pub type Result<T> = std::result::Result<T, Error>;

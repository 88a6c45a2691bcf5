//! Error types for audio-core

use thiserror::Error;

/// Errors produced by audio conversions
#[derive(Debug, Error)]
pub enum Error {
    /// The requested sample-rate conversion is not one of the supported pairs
    #[error("unsupported resample pair: {from} Hz -> {to} Hz")]
    UnsupportedResample { from: u32, to: u32 },

    /// A codec was asked to handle a payload type it does not own
    #[error("unsupported payload type: {0}")]
    UnsupportedPayloadType(u8),

    /// A DTMF sequence contained a character outside 0-9 * # A-D
    #[error("invalid DTMF digit: {0:?}")]
    InvalidDigit(char),

    /// Input bytes could not be interpreted as the expected format
    #[error("invalid audio data: {0}")]
    InvalidData(String),
}

/// Result alias for audio-core operations
pub type Result<T> = std::result::Result<T, Error>;

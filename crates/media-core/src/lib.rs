//! # Media core library for the voxbridge project
//!
//! `media-core` is the per-call speech machinery between the RTP transport
//! and the external speech services:
//!
//! - **VAD**: adaptive voice activity detection with noise calibration,
//!   debouncing and an echo gate against in-flight TTS audio
//! - **Engines**: the narrow adapter traits for STT, TTS and response
//!   generation the connector consumes (the services themselves are external)
//! - **Transcripts**: the partial/final state machine with stale-partial
//!   promotion and timeout handling
//! - **Pacer**: streaming TTS synthesis chopped into RTP-sized payloads with
//!   barge-in interruption
//! - **Session**: the orchestrating task that wires all of the above for one
//!   call
//!
//! Every component here is owned by exactly one task; cross-task state is
//! limited to the echo gate and the interrupt flag, both designed for it.

pub mod engines;
pub mod error;
pub mod pacer;
pub mod session;
pub mod transcript;
pub mod vad;

pub use engines::{
    EchoResponder, ResponderReply, SttConfig, SttEngine, SttResult, SttStream, TtsChunkStream,
    TtsEngine, Responder,
};
pub use error::{Error, Result};
pub use pacer::{TtsPacer, TtsPacerConfig};
pub use session::{SpeechSession, SessionConfig, SessionEvent};
pub use transcript::TranscriptHandler;
pub use vad::{AdaptiveVad, EchoGate, VadConfig};

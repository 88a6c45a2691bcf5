//! Adapter traits for the external speech services
//!
//! The connector never implements speech recognition or synthesis itself; it
//! consumes three narrow interfaces. Concrete implementations (a Vosk-style
//! websocket STT, a Piper-style TTS, an LLM or intent responder) live in the
//! binary and are selected by configuration. The in-crate [`EchoResponder`]
//! is the default and doubles as the test double.

use async_trait::async_trait;
use futures::stream::Stream;
use serde::Deserialize;
use std::pin::Pin;

use crate::error::{Error, Result};

/// Initial configuration sent when an STT stream opens (and re-sent after
/// every reconnect)
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Sample rate of the audio that will be streamed
    pub sample_rate: u32,
    /// Channel count (always 1 for telephony)
    pub channels: u8,
    /// Ask the service for word-level timing
    pub show_words: Option<bool>,
    /// Cap on n-best alternatives
    pub max_alternatives: Option<u32>,
    /// Bias phrases for recognition
    pub phrase_list: Option<Vec<String>>,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            show_words: None,
            max_alternatives: None,
            phrase_list: None,
        }
    }
}

/// One message from the STT service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttResult {
    /// A revisable transcription snapshot
    Partial(String),
    /// A committed utterance
    Final(String),
}

/// An open streaming session with the STT service
#[async_trait]
pub trait SttStream: Send {
    /// Forward a chunk of 16-bit PCM audio
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<()>;

    /// Receive the next transcript message.
    ///
    /// `Ok(None)` means a bounded wait elapsed with nothing to report;
    /// [`Error::SttDisconnected`] means the connection is gone and the
    /// caller should reconnect.
    async fn recv(&mut self) -> Result<Option<SttResult>>;

    /// Close the stream, sending EOF when the service supports it
    async fn close(&mut self) -> Result<()>;
}

/// Factory for STT streams
#[async_trait]
pub trait SttEngine: Send + Sync {
    /// Open a new streaming session
    async fn open_stream(&self, config: &SttConfig) -> Result<Box<dyn SttStream>>;
}

/// A stream of PCM16 chunks from the TTS service, at its native sample rate
pub type TtsChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Streaming text-to-speech synthesis
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Synthesize `text` into a stream of PCM16 chunks.
    ///
    /// Dropping the returned stream cancels the synthesis mid-flight.
    async fn synthesize(&self, text: &str, voice: &str, sample_rate: u32) -> Result<TtsChunkStream>;
}

/// A reply from the responder, either complete or streamed as tokens
pub enum ResponderReply {
    /// A full reply string
    Text(String),
    /// A token stream to be aggregated into sentences before synthesis
    Stream(Pin<Box<dyn Stream<Item = String> + Send>>),
}

impl std::fmt::Debug for ResponderReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponderReply::Text(t) => f.debug_tuple("Text").field(t).finish(),
            ResponderReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Turns a committed user utterance into the bot's reply.
///
/// Whether this is an LLM, an intent service or a plain echo is a deployment
/// choice; the session never interprets the text.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Generate the reply for a final transcript
    async fn respond(&self, call_id: &str, user_text: &str) -> Result<ResponderReply>;

    /// Classify the intent of an utterance, when the deployment has an
    /// intent service. Used by scenario validation steps.
    async fn intent(&self, _call_id: &str, _user_text: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// The default responder: plays the caller's words back.
#[derive(Debug, Default, Clone)]
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, _call_id: &str, user_text: &str) -> Result<ResponderReply> {
        Ok(ResponderReply::Text(user_text.to_string()))
    }
}

/// Wire shape of a Vosk-style transcript message
#[derive(Debug, Deserialize)]
struct RawTranscript {
    partial: Option<String>,
    text: Option<String>,
}

/// Parse a JSON transcript message in the `{"partial": ...}` / `{"text": ...}`
/// convention streaming recognizers use.
///
/// A message carrying both fields reports the final. Messages with neither
/// are malformed and should be dropped by the caller.
pub fn parse_transcript_json(message: &str) -> Result<SttResult> {
    let raw: RawTranscript = serde_json::from_str(message)
        .map_err(|e| Error::MalformedTranscript(format!("{e}: {message:.100}")))?;
    if let Some(text) = raw.text {
        return Ok(SttResult::Final(text.trim().to_string()));
    }
    if let Some(partial) = raw.partial {
        return Ok(SttResult::Partial(partial.trim().to_string()));
    }
    Err(Error::MalformedTranscript("neither partial nor text present".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_and_final() {
        assert_eq!(
            parse_transcript_json(r#"{"partial": " hello "}"#).unwrap(),
            SttResult::Partial("hello".into())
        );
        assert_eq!(
            parse_transcript_json(r#"{"text": "hello world"}"#).unwrap(),
            SttResult::Final("hello world".into())
        );
    }

    #[test]
    fn final_wins_when_both_present() {
        assert_eq!(
            parse_transcript_json(r#"{"partial": "hel", "text": "hello"}"#).unwrap(),
            SttResult::Final("hello".into())
        );
    }

    #[test]
    fn malformed_messages_are_errors() {
        assert!(parse_transcript_json("not json").is_err());
        assert!(parse_transcript_json(r#"{"other": 1}"#).is_err());
    }

    #[tokio::test]
    async fn echo_responder_replays_text() {
        let responder = EchoResponder;
        match responder.respond("c1", "say this back").await.unwrap() {
            ResponderReply::Text(t) => assert_eq!(t, "say this back"),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(responder.intent("c1", "anything").await.unwrap(), None);
    }
}

//! Connector configuration
//!
//! Grouped knobs loaded from a JSON file, with environment-variable
//! overrides for the values that differ between deployments. Everything has
//! a default so a bare `EngineConfig::default()` runs on localhost.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use voxbridge_audio_core::CodecKind;
use voxbridge_media_core::{SessionConfig, VadConfig};
use voxbridge_rtp_core::PortPoolConfig;

use crate::error::{Error, Result};

fn default_true() -> bool {
    true
}

/// SIP-facing addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipSettings {
    /// Address for switch event datagrams
    pub event_ip: IpAddr,
    /// Port for switch event datagrams
    pub event_port: u16,
    /// Address for SIP requests
    pub sip_ip: IpAddr,
    /// Port for SIP requests
    pub sip_port: u16,
    /// IP advertised in Contact headers and answer SDP
    pub advertised_ip: String,
    /// User part of the Contact URI
    pub service_user: String,
}

impl Default for SipSettings {
    fn default() -> Self {
        Self {
            event_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            event_port: 8090,
            sip_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            sip_port: 8089,
            advertised_ip: "127.0.0.1".into(),
            service_user: "voxbridge".into(),
        }
    }
}

/// RTP transport knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpSettings {
    /// Local bind address for media sockets
    pub bind_ip: IpAddr,
    /// Lowest RTP port
    pub min_port: u16,
    /// Highest RTP port
    pub max_port: u16,
    /// Receive buffer per datagram
    pub receive_buffer_size: usize,
    /// Grace given to the paced sender on stop, in milliseconds
    pub sender_stop_timeout_ms: u64,
}

impl Default for RtpSettings {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            min_port: 35000,
            max_port: 65000,
            receive_buffer_size: 4096,
            sender_stop_timeout_ms: 1000,
        }
    }
}

impl RtpSettings {
    /// Port pool covering the configured range
    pub fn pool_config(&self) -> PortPoolConfig {
        PortPoolConfig { min_port: self.min_port, max_port: self.max_port }
    }
}

/// Codec negotiation knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecSettings {
    /// Preference order for the answer ("PCMU", "PCMA", "opus")
    pub preference: Vec<String>,
    /// Packet time override in milliseconds (0 keeps the default)
    pub ptime_ms: u32,
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self { preference: vec!["PCMU".into(), "PCMA".into(), "opus".into()], ptime_ms: 0 }
    }
}

impl CodecSettings {
    /// Resolve the preference list to codec kinds, skipping unknown names
    pub fn preference_order(&self) -> Vec<CodecKind> {
        self.preference
            .iter()
            .filter_map(|name| match name.to_ascii_uppercase().as_str() {
                "PCMU" => Some(CodecKind::Pcmu),
                "PCMA" => Some(CodecKind::Pcma),
                "OPUS" => Some(CodecKind::Opus),
                _ => None,
            })
            .collect()
    }
}

/// VAD tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    /// Initial detection threshold
    pub threshold_init: f32,
    /// Lower threshold clamp
    pub min_threshold: f32,
    /// Upper threshold clamp
    pub max_threshold: f32,
    /// Calibration window in milliseconds
    pub calibration_window_ms: u32,
    /// Minimum speech run to confirm speaking, in milliseconds
    pub min_speech_ms: u32,
    /// Minimum quiet run to confirm silence, in milliseconds
    pub min_silence_ms: u32,
    /// Secondary detector aggressiveness (0-3)
    pub webrtc_aggressiveness: u8,
    /// Consecutive speech frames to confirm speech
    pub speech_debounce_frames: u32,
    /// Consecutive silence frames to confirm silence
    pub silence_debounce_frames: u32,
    /// Echo-gate cooldown after TTS, in milliseconds
    pub tts_cooldown_ms: u32,
}

impl Default for VadSettings {
    fn default() -> Self {
        let d = VadConfig::default();
        Self {
            threshold_init: d.initial_threshold,
            min_threshold: d.min_threshold,
            max_threshold: d.max_threshold,
            calibration_window_ms: d.calibration_window_ms,
            min_speech_ms: 300,
            min_silence_ms: 500,
            webrtc_aggressiveness: d.aggressiveness,
            speech_debounce_frames: d.speech_debounce_frames,
            silence_debounce_frames: d.silence_debounce_frames,
            tts_cooldown_ms: d.tts_cooldown_ms,
        }
    }
}

impl VadSettings {
    /// Build the media-core VAD configuration.
    ///
    /// The millisecond minimums and the frame-count debounce express the
    /// same idea at different granularities; the stricter of the two wins,
    /// measured against the session's VAD chunk size.
    pub fn vad_config(&self) -> VadConfig {
        let chunk_ms = 100u32;
        let speech_frames = self
            .speech_debounce_frames
            .max(self.min_speech_ms.div_ceil(chunk_ms).max(1));
        let silence_frames = self
            .silence_debounce_frames
            .max(self.min_silence_ms.div_ceil(chunk_ms).max(1));
        VadConfig {
            sample_rate: 16000,
            initial_threshold: self.threshold_init,
            min_threshold: self.min_threshold,
            max_threshold: self.max_threshold,
            calibration_window_ms: self.calibration_window_ms,
            speech_debounce_frames: speech_frames,
            silence_debounce_frames: silence_frames,
            tts_cooldown_ms: self.tts_cooldown_ms,
            aggressiveness: self.webrtc_aggressiveness,
        }
    }
}

/// Session timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Force-final after this much continuous speech, in seconds
    pub speech_timeout_s: f64,
    /// Force-final after this much post-speech silence, in seconds
    pub silence_timeout_s: f64,
    /// Promote an unchanged partial after this long, in seconds
    pub stale_partial_timeout_s: f64,
    /// Continuous speech during TTS to trigger barge-in, in seconds
    pub barge_in_threshold_s: f64,
    /// Send EOF to the recognizer on close
    #[serde(default = "default_true")]
    pub stt_send_eof: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            speech_timeout_s: 10.0,
            silence_timeout_s: 3.0,
            stale_partial_timeout_s: 2.5,
            barge_in_threshold_s: 1.5,
            stt_send_eof: true,
        }
    }
}

impl SessionSettings {
    /// Build the media-core session configuration for one call
    pub fn session_config(&self, call_id: &str) -> SessionConfig {
        SessionConfig {
            call_id: call_id.to_string(),
            send_eof: self.stt_send_eof,
            speech_timeout: Duration::from_secs_f64(self.speech_timeout_s),
            silence_timeout: Duration::from_secs_f64(self.silence_timeout_s),
            stale_partial_timeout: Duration::from_secs_f64(self.stale_partial_timeout_s),
            barge_in_threshold: Duration::from_secs_f64(self.barge_in_threshold_s),
            ..SessionConfig::default()
        }
    }
}

/// TTS knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    /// Voice identifier passed to the engine
    pub voice: String,
    /// Sample rate the engine produces
    pub input_rate: u32,
    /// Telephony rate for the wire
    pub target_output_rate: u32,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self { voice: "default".into(), input_rate: 22050, target_output_rate: 8000 }
    }
}

/// The complete connector configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SIP-facing addresses
    pub sip: SipSettings,
    /// RTP transport knobs
    pub rtp: RtpSettings,
    /// Codec negotiation
    pub codec: CodecSettings,
    /// VAD tuning
    pub vad: VadSettings,
    /// Session timeouts
    pub session: SessionSettings,
    /// TTS knobs
    pub tts: TtsSettings,
}

impl EngineConfig {
    /// Load configuration from a JSON file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply the environment overrides deployments commonly set
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("VOXBRIDGE_EVENT_PORT") {
            if let Ok(port) = v.parse() {
                self.sip.event_port = port;
            }
        }
        if let Ok(v) = std::env::var("VOXBRIDGE_SIP_PORT") {
            if let Ok(port) = v.parse() {
                self.sip.sip_port = port;
            }
        }
        if let Ok(v) = std::env::var("VOXBRIDGE_ADVERTISED_IP") {
            self.sip.advertised_ip = v;
        }
        if let Ok(v) = std::env::var("VOXBRIDGE_RTP_MIN_PORT") {
            if let Ok(port) = v.parse() {
                self.rtp.min_port = port;
            }
        }
        if let Ok(v) = std::env::var("VOXBRIDGE_RTP_MAX_PORT") {
            if let Ok(port) = v.parse() {
                self.rtp.max_port = port;
            }
        }
        if let Ok(v) = std::env::var("VOXBRIDGE_TTS_VOICE") {
            self.tts.voice = v;
        }
    }

    /// Sanity-check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.rtp.min_port > self.rtp.max_port {
            return Err(Error::Config(format!(
                "rtp.min_port {} exceeds rtp.max_port {}",
                self.rtp.min_port, self.rtp.max_port
            )));
        }
        if self.codec.preference_order().is_empty() {
            return Err(Error::Config("codec.preference lists no known codec".into()));
        }
        if !(0.0..=1.0).contains(&self.vad.threshold_init) {
            return Err(Error::Config("vad.threshold_init outside [0, 1]".into()));
        }
        Ok(())
    }
}

//! Adaptive voice activity detection
//!
//! Classifies 16 kHz linear frames as speech or non-speech, with three layers
//! on top of the raw energy detector:
//!
//! 1. **Echo gate** — while the bot's own TTS is playing (or shortly after),
//!    frames are rejected unless a stricter secondary detector insists the
//!    caller is really talking over the bot.
//! 2. **Calibration** — a rolling window of recent audio is analyzed every
//!    couple of seconds and the detection threshold adapts to the measured
//!    noise floor, SNR and dynamic range, drifting back to its base value
//!    when conditions normalize.
//! 3. **Debouncing** — the externally visible speaking state only flips
//!    after a configured number of consecutive agreeing frames.
//!
//! The detector itself is a normalized-energy classifier standing in for a
//! model-based one; the surrounding machinery does not depend on which.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use voxbridge_audio_core::Sample;

/// Configuration knobs for the VAD
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate of the frames handed to the detector
    pub sample_rate: u32,
    /// Initial detection threshold
    pub initial_threshold: f32,
    /// Lower clamp for the adaptive threshold
    pub min_threshold: f32,
    /// Upper clamp for the adaptive threshold
    pub max_threshold: f32,
    /// Rolling calibration window
    pub calibration_window_ms: u32,
    /// Consecutive speech frames required to flip to speaking
    pub speech_debounce_frames: u32,
    /// Consecutive silence frames required to flip to quiet
    pub silence_debounce_frames: u32,
    /// Echo-gate cooldown after TTS finishes
    pub tts_cooldown_ms: u32,
    /// Secondary detector aggressiveness (0-3); higher demands more energy
    pub aggressiveness: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            initial_threshold: 0.30,
            min_threshold: 0.15,
            max_threshold: 0.60,
            calibration_window_ms: 4000,
            speech_debounce_frames: 3,
            silence_debounce_frames: 2,
            tts_cooldown_ms: 300,
            aggressiveness: 3,
        }
    }
}

/// Shared state between the VAD and the TTS pacer.
///
/// The pacer registers every chunk it enqueues; the VAD consults the gate
/// before believing any frame. This is the only piece of VAD state touched
/// by more than one task.
#[derive(Debug)]
pub struct EchoGate {
    tts_active: AtomicBool,
    last_tts_activity: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl EchoGate {
    /// Create a gate with the given cooldown
    pub fn new(cooldown: Duration) -> Arc<Self> {
        Arc::new(Self { tts_active: AtomicBool::new(false), last_tts_activity: Mutex::new(None), cooldown })
    }

    /// Register a TTS chunk headed for the wire
    pub fn register_tts_chunk(&self) {
        self.tts_active.store(true, Ordering::Relaxed);
        *self.last_tts_activity.lock() = Some(Instant::now());
    }

    /// TTS finished (or was interrupted); the cooldown starts now
    pub fn tts_finished(&self) {
        self.tts_active.store(false, Ordering::Relaxed);
        *self.last_tts_activity.lock() = Some(Instant::now());
    }

    /// Whether TTS audio is currently in flight
    pub fn is_tts_active(&self) -> bool {
        self.tts_active.load(Ordering::Relaxed)
    }

    /// Whether the gate suppresses VAD at `now`
    pub fn is_gating(&self, now: Instant) -> bool {
        if self.is_tts_active() {
            return true;
        }
        match *self.last_tts_activity.lock() {
            Some(last) => now.saturating_duration_since(last) < self.cooldown,
            None => false,
        }
    }
}

/// Frame metrics used by calibration
#[derive(Debug, Clone, Copy, Default)]
struct AudioMetrics {
    rms: f32,
    peak: f32,
    noise_floor: f32,
    snr: f32,
    dynamic_range: f32,
}

fn compute_metrics(samples: &[f32]) -> AudioMetrics {
    if samples.is_empty() {
        return AudioMetrics::default();
    }
    let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
    let mut sorted: Vec<f32> = samples.iter().map(|s| s.abs()).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let peak = *sorted.last().unwrap_or(&0.0);

    let p10 = sorted[sorted.len() / 10];
    let p90 = sorted[sorted.len() * 9 / 10];
    let noise_floor = p10.max(1e-10);

    let snr = if peak > 0.0 { 20.0 * (peak / noise_floor).log10() } else { 0.0 };
    let dynamic_range = if p10 > 1e-10 { 20.0 * (p90 / p10).log10() } else { 0.0 };

    AudioMetrics { rms, peak, noise_floor, snr, dynamic_range }
}

/// One calibration pass outcome
#[derive(Debug, Clone, Copy)]
struct CalibrationRecord {
    at: Instant,
    is_high_noise: bool,
}

/// The adaptive VAD for one call.
///
/// Owned and mutated by the session task only; other tasks interact through
/// the shared [`EchoGate`].
pub struct AdaptiveVad {
    config: VadConfig,
    echo_gate: Arc<EchoGate>,

    threshold: f32,
    history: VecDeque<(Instant, Vec<f32>)>,
    calibration_history: VecDeque<CalibrationRecord>,
    last_calibration: Option<Instant>,

    consecutive_speech: u32,
    consecutive_silence: u32,
    is_speaking: bool,

    speech_start: Option<Instant>,
    last_speech_activity: Option<Instant>,
}

impl AdaptiveVad {
    /// Create a VAD wired to an echo gate
    pub fn new(config: VadConfig, echo_gate: Arc<EchoGate>) -> Self {
        let threshold = config.initial_threshold;
        Self {
            config,
            echo_gate,
            threshold,
            history: VecDeque::new(),
            calibration_history: VecDeque::new(),
            last_calibration: None,
            consecutive_speech: 0,
            consecutive_silence: 0,
            is_speaking: false,
            speech_start: None,
            last_speech_activity: None,
        }
    }

    /// The echo gate shared with the TTS pacer
    pub fn echo_gate(&self) -> Arc<EchoGate> {
        self.echo_gate.clone()
    }

    /// Current adaptive threshold
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Debounced speaking state
    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    /// How long the current speech run has lasted
    pub fn speaking_duration(&self, now: Instant) -> Option<Duration> {
        if self.is_speaking {
            self.speech_start.map(|s| now.saturating_duration_since(s))
        } else {
            None
        }
    }

    /// Time since speech was last active (None until speech has occurred)
    pub fn silence_duration(&self, now: Instant) -> Option<Duration> {
        if self.is_speaking {
            return None;
        }
        self.last_speech_activity.map(|t| now.saturating_duration_since(t))
    }

    /// Reset debounce and timing state after an utterance is committed
    pub fn reset_state(&mut self) {
        self.consecutive_speech = 0;
        self.consecutive_silence = 0;
        self.is_speaking = false;
        self.speech_start = None;
        self.last_speech_activity = None;
    }

    /// Classify a frame using the current wall clock
    pub fn process(&mut self, frame: &[Sample]) -> bool {
        self.process_at(frame, Instant::now())
    }

    /// Classify a frame at an explicit instant (the clock is injected so the
    /// calibration windows are testable).
    ///
    /// Callers hand the VAD buffered chunks of roughly 100 ms so the
    /// secondary detector has enough 20 ms sub-frames to overrule the echo
    /// gate on genuine double-talk.
    pub fn process_at(&mut self, frame: &[Sample], now: Instant) -> bool {
        let normalized: Vec<f32> = frame.iter().map(|&s| s as f32 / 32768.0).collect();
        let metrics = compute_metrics(&normalized);

        // Echo gate: during TTS or its cooldown, only clear double-talk from
        // the secondary detector gets through.
        if self.echo_gate.is_gating(now) && !self.secondary_confirms_speech(&normalized) {
            return false;
        }

        // Too quiet for any reliable decision; the frame still counts as
        // silence evidence for debouncing, but calibration is left untouched
        // so all-zero frames cannot skew it.
        if metrics.rms < 0.006 {
            return self.debounce(false, now);
        }

        self.update_calibration(&normalized, now);

        if self.is_extreme_noise(&metrics) {
            debug!(rms = metrics.rms, threshold = self.threshold, "bypassing detection in extreme noise");
            return false;
        }

        let raw_speech = self.speech_score(metrics.rms) >= self.threshold;
        let debounced = self.debounce(raw_speech, now);

        // In heavy noise a debounced positive still needs a second opinion.
        if debounced && self.threshold > 0.4 {
            let ratio = self.secondary_speech_ratio(&normalized);
            if ratio < 0.5 && metrics.rms < 0.04 {
                debug!(ratio, rms = metrics.rms, "secondary detector vetoed speech in high noise");
                return false;
            }
        }

        debounced
    }

    /// Normalized speech score for a frame's RMS. Stands in for a model
    /// probability: full-scale speech saturates at 1.0 well above the
    /// threshold band.
    fn speech_score(&self, rms: f32) -> f32 {
        (rms * 5.0).min(1.0)
    }

    fn debounce(&mut self, raw_speech: bool, now: Instant) -> bool {
        if raw_speech {
            self.consecutive_speech += 1;
            self.consecutive_silence = 0;
            if self.consecutive_speech >= self.config.speech_debounce_frames && !self.is_speaking {
                debug!(frames = self.consecutive_speech, "speech confirmed");
                self.is_speaking = true;
                self.speech_start = Some(now);
            }
        } else {
            self.consecutive_silence += 1;
            self.consecutive_speech = 0;
            if self.consecutive_silence >= self.config.silence_debounce_frames && self.is_speaking {
                debug!(frames = self.consecutive_silence, "silence confirmed");
                self.is_speaking = false;
                self.speech_start = None;
            }
        }
        if self.is_speaking {
            self.last_speech_activity = Some(now);
        }
        self.is_speaking
    }

    /// Secondary detector: stricter, frame-chopped energy classifier used
    /// for echo override and high-noise confirmation.
    fn secondary_speech_ratio(&self, normalized: &[f32]) -> f32 {
        let frame_len = (self.config.sample_rate as usize / 1000) * 20;
        if normalized.len() < frame_len {
            return 0.0;
        }
        let strict_rms = match self.config.aggressiveness {
            0 => 0.010,
            1 => 0.015,
            2 => 0.022,
            _ => 0.030,
        };
        let mut speech = 0usize;
        let mut total = 0usize;
        for chunk in normalized.chunks(frame_len).take(5) {
            if chunk.len() < frame_len {
                break;
            }
            total += 1;
            let rms = (chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32).sqrt();
            if rms >= strict_rms {
                speech += 1;
            }
        }
        if total == 0 {
            return 0.0;
        }
        speech as f32 / total as f32
    }

    fn secondary_confirms_speech(&self, normalized: &[f32]) -> bool {
        let frame_len = (self.config.sample_rate as usize / 1000) * 20;
        let frames = (normalized.len() / frame_len).min(5);
        if frames == 0 {
            return false;
        }
        let ratio = self.secondary_speech_ratio(normalized);
        // Two or more of the inspected sub-frames must read as clear speech
        ratio * frames as f32 >= 2.0
    }

    fn is_extreme_noise(&self, metrics: &AudioMetrics) -> bool {
        if self.calibration_history.len() < 3 {
            return false;
        }
        let recent_high = self
            .calibration_history
            .iter()
            .rev()
            .take(3)
            .filter(|r| r.is_high_noise)
            .count();
        recent_high == 3 && self.threshold > 0.45 && metrics.rms > 0.012 && metrics.peak < 0.7
    }

    fn update_calibration(&mut self, normalized: &[f32], now: Instant) {
        self.history.push_back((now, normalized.to_vec()));
        let window = Duration::from_millis(self.config.calibration_window_ms as u64);
        while let Some((at, _)) = self.history.front() {
            if now.saturating_duration_since(*at) > window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        // Recalibrate at most every 2 seconds
        if let Some(last) = self.last_calibration {
            if now.saturating_duration_since(last) < Duration::from_secs(2) {
                return;
            }
        }

        let window_samples = (self.config.sample_rate as usize * self.config.calibration_window_ms as usize) / 1000;
        let buffered: usize = self.history.iter().map(|(_, f)| f.len()).sum();
        if buffered < window_samples / 2 {
            return;
        }

        let concat: Vec<f32> = self.history.iter().flat_map(|(_, f)| f.iter().copied()).collect();
        let m = compute_metrics(&concat);

        // Noise trend strength: consecutive high-noise calibrations escalate
        // the threshold adjustment.
        let consecutive_noise = self
            .calibration_history
            .iter()
            .rev()
            .take(3)
            .take_while(|r| r.is_high_noise)
            .count();
        let trend_strength = match consecutive_noise {
            0 => 1.0,
            3 => 2.0,
            _ => 1.5,
        };

        let mut is_high_noise = (m.noise_floor > 0.018)
            || (m.snr < 20.0 && m.rms > 0.009)
            || (m.rms > 0.05 && m.dynamic_range < 10.0);
        if m.rms < 0.008 {
            is_high_noise = false;
        }

        let mut new_threshold = self.threshold;
        if is_high_noise {
            if self.threshold < self.config.max_threshold * 0.9 {
                let step = if m.snr < 5.0 { 0.08 } else { 0.05 } * trend_strength;
                new_threshold = (self.threshold + step).min(self.config.max_threshold);
                info!(
                    threshold = new_threshold,
                    noise_floor = m.noise_floor,
                    snr = m.snr,
                    trend_strength,
                    "high noise environment, raising VAD threshold"
                );
            }
        } else if (m.noise_floor < 0.01 && m.snr > 20.0) || m.rms < 0.0025 {
            let step = if self.threshold > 0.5 {
                0.10
            } else if self.threshold > 0.4 {
                0.08
            } else {
                0.05
            };
            new_threshold = (self.threshold - step).max(self.config.min_threshold);
            info!(threshold = new_threshold, "low noise environment, lowering VAD threshold");
        } else if m.peak < 0.1 {
            new_threshold = (self.threshold - 0.02).max(self.config.min_threshold);
        } else if m.peak > 0.8 {
            new_threshold = (self.threshold + 0.05).min(self.config.max_threshold);
        }

        if (new_threshold - self.threshold).abs() > f32::EPSILON {
            self.threshold = new_threshold;
            self.calibration_history.push_back(CalibrationRecord { at: now, is_high_noise });
            while self.calibration_history.len() > 16 {
                self.calibration_history.pop_front();
            }
        } else if let Some(last) = self.calibration_history.back() {
            // Unconditional drift toward the base threshold once conditions
            // have been stable for 30 seconds.
            if now.saturating_duration_since(last.at) > Duration::from_secs(30) {
                let base = self.config.initial_threshold;
                if (self.threshold - base).abs() > 0.05 {
                    let step = if (self.threshold - base).abs() > 0.15 { 0.05 } else { 0.03 };
                    if self.threshold > base {
                        self.threshold = (self.threshold - step).max(base);
                    } else {
                        self.threshold = (self.threshold + step).min(base);
                    }
                    info!(threshold = self.threshold, base, "VAD threshold drifting toward base");
                    self.calibration_history.push_back(CalibrationRecord { at: now, is_high_noise: false });
                }
            }
        }

        self.last_calibration = Some(now);
    }
}

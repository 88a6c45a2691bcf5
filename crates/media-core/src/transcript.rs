//! Transcript state machine
//!
//! Tracks the partial/final transcript pair for one call. Partials are
//! revisable snapshots; a final is a committed utterance. A partial that
//! stops changing for long enough is promoted to a final, and the session's
//! watchdog can force whatever partial exists into a final on speech or
//! silence timeouts.

use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::engines::SttResult;

/// Minimum length for a partial to be worth promoting
const MIN_PROMOTABLE_CHARS: usize = 2;

/// Per-call transcript state
#[derive(Debug, Default)]
pub struct TranscriptHandler {
    last_partial: String,
    last_partial_at: Option<Instant>,
    last_final: String,
}

impl TranscriptHandler {
    /// Fresh, empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one STT message. Returns the committed utterance when the
    /// message produced a final.
    pub fn handle(&mut self, result: SttResult, now: Instant) -> Option<String> {
        match result {
            SttResult::Partial(text) => {
                let text = text.trim().to_string();
                if text != self.last_partial {
                    if !text.is_empty() {
                        debug!(partial = %text, "partial transcript");
                    }
                    self.last_partial = text;
                    self.last_partial_at = Some(now);
                }
                None
            }
            SttResult::Final(text) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    // Recognizers emit empty finals between utterances; a
                    // committed final is never shadowed by them.
                    return None;
                }
                info!(final_text = %text, "final transcript");
                self.last_final = text.clone();
                self.last_partial.clear();
                self.last_partial_at = None;
                Some(text)
            }
        }
    }

    /// Whether the current partial has been unchanged for at least
    /// `max_unchanged`
    pub fn has_stale_partial(&self, max_unchanged: Duration, now: Instant) -> bool {
        if self.last_partial.len() < MIN_PROMOTABLE_CHARS {
            return false;
        }
        match self.last_partial_at {
            Some(at) => now.saturating_duration_since(at) >= max_unchanged,
            None => false,
        }
    }

    /// Promote the pending partial to a final (stale promotion or timeout
    /// forcing). Returns the committed text, or `None` when the partial is
    /// empty or too short to commit.
    pub fn force_final(&mut self, reason: &str) -> Option<String> {
        let text = self.last_partial.trim().to_string();
        self.last_partial.clear();
        self.last_partial_at = None;
        if text.len() < MIN_PROMOTABLE_CHARS {
            debug!(reason, "no promotable partial to force");
            return None;
        }
        info!(reason, final_text = %text, "promoting partial to final");
        self.last_final = text.clone();
        Some(text)
    }

    /// Clear partial state (barge-in, utterance handoff)
    pub fn clear_partial(&mut self) {
        self.last_partial.clear();
        self.last_partial_at = None;
    }

    /// Clear everything
    pub fn clear(&mut self) {
        self.clear_partial();
        self.last_final.clear();
    }

    /// Current (possibly empty) partial
    pub fn partial(&self) -> &str {
        &self.last_partial
    }

    /// Most recent committed final
    pub fn last_final(&self) -> &str {
        &self.last_final
    }

    /// The most definitive text available: the final, else the pending partial
    pub fn definitive(&self) -> &str {
        if !self.last_final.is_empty() {
            &self.last_final
        } else {
            &self.last_partial
        }
    }
}

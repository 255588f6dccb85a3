//! Barge-in: caller speech that cancels in-flight agent playback.
//!
//! The controller only decides; the session applies the effects (cancel
//! playback, invalidate the pending mark, force `listening`). Engagement is
//! one-shot per playback so rapid repeated speech-activity signals during a
//! single interruption never double-cancel or double-transition.

use crate::config::BargeInConfig;
use crate::state::CallState;

/// A recognizer signal that may count as an interruption.
#[derive(Debug, Clone, Copy)]
pub enum SpeechActivity<'a> {
    /// Out-of-band speech-started event. Always qualifies.
    Started,
    /// An interim transcript fragment.
    ///
    /// Qualifies only at the configured length floor and, when the
    /// recognizer reports one, the configured confidence floor.
    Interim {
        text: &'a str,
        confidence: Option<f32>,
    },
}

/// Decides when caller speech interrupts agent playback.
#[derive(Debug)]
pub struct BargeInController {
    config: BargeInConfig,
    engaged: bool,
}

impl BargeInController {
    pub fn new(config: BargeInConfig) -> Self {
        Self {
            config,
            engaged: false,
        }
    }

    /// Re-arm for a new playback. Called whenever agent audio starts.
    pub fn arm(&mut self) {
        self.engaged = false;
    }

    /// Whether the current playback has already been interrupted.
    pub fn engaged(&self) -> bool {
        self.engaged
    }

    /// Decide whether `activity` interrupts the current playback.
    ///
    /// Returns `true` at most once per armed playback, and only while the
    /// call is in `speaking`.
    pub fn should_interrupt(&mut self, state: CallState, activity: SpeechActivity<'_>) -> bool {
        if !self.config.enabled || self.engaged || state != CallState::Speaking {
            return false;
        }

        let triggers = match activity {
            SpeechActivity::Started => true,
            SpeechActivity::Interim { text, confidence } => {
                text.trim().chars().count() >= self.config.min_interim_chars
                    && confidence.is_none_or(|c| c >= self.config.min_confidence)
            }
        };

        if triggers {
            self.engaged = true;
        }
        triggers
    }
}

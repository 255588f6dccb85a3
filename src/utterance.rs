//! Assembles discrete caller utterances from streaming recognition fragments.
//!
//! The recognizer emits a mix of interim and final transcript fragments.
//! Only final fragments accumulate; an utterance-end signal (or a final
//! fragment the recognizer marks speech-final) flushes the accumulator as
//! one completed utterance. Interim fragments are left to the barge-in path
//! and never accumulate here.

/// Accumulates final transcript fragments into completed utterances.
#[derive(Debug)]
pub struct UtteranceAssembler {
    current: String,
    min_fragment_chars: usize,
}

impl UtteranceAssembler {
    /// `min_fragment_chars` is the noise floor: final fragments shorter than
    /// this after trimming are discarded and never flushed.
    pub fn new(min_fragment_chars: usize) -> Self {
        Self {
            current: String::new(),
            min_fragment_chars,
        }
    }

    /// Feed one transcript fragment.
    ///
    /// Returns a completed utterance when the fragment carried a
    /// speech-final flag and the accumulator was non-empty.
    pub fn push_fragment(
        &mut self,
        text: &str,
        is_final: bool,
        speech_final: bool,
    ) -> Option<String> {
        if !is_final {
            return None;
        }

        let trimmed = text.trim();
        if trimmed.chars().count() >= self.min_fragment_chars {
            if !self.current.is_empty() {
                self.current.push(' ');
            }
            self.current.push_str(trimmed);
        }

        // The speech-final signal flushes whatever has accumulated, even
        // when the carrying fragment itself was discarded as noise.
        if speech_final { self.flush() } else { None }
    }

    /// Feed an out-of-band utterance-end signal.
    pub fn utterance_end(&mut self) -> Option<String> {
        self.flush()
    }

    /// Whether fragments are waiting for an end signal.
    pub fn has_pending(&self) -> bool {
        !self.current.is_empty()
    }

    fn flush(&mut self) -> Option<String> {
        if self.current.trim().is_empty() {
            self.current.clear();
            return None;
        }
        Some(std::mem::take(&mut self.current))
    }
}

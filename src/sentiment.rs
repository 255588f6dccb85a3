//! Heuristic text analysis of caller utterances.
//!
//! A fast keyword scan (well under a millisecond) runs on every completed
//! utterance before it reaches the language model, so the caller profile
//! tracks sentiment and urgency even when the model never mentions either.
//! Dominance decides sentiment: more negative hits than positive means
//! `Negative`, the reverse means `Positive`, a tie (including zero hits)
//! stays `Neutral`. Two or more distinct urgency keywords escalate the
//! profile urgency to critical.

use crate::profile::Sentiment;

/// Distinct urgency keyword hits required to escalate to critical.
pub const URGENCY_CRITICAL_HITS: usize = 2;

// ── Keyword tables ──────────────────────────────────────────────────────

const POSITIVE_WORDS: &[&str] = &[
    "great",
    "thanks",
    "thank you",
    "perfect",
    "wonderful",
    "awesome",
    "appreciate",
    "happy",
    "excellent",
    "sounds good",
    "brilliant",
];

const NEGATIVE_WORDS: &[&str] = &[
    "angry",
    "frustrated",
    "upset",
    "terrible",
    "awful",
    "unacceptable",
    "annoyed",
    "disappointed",
    "worst",
    "ridiculous",
    "complaint",
    "broken",
];

const URGENCY_WORDS: &[&str] = &[
    "urgent",
    "emergency",
    "immediately",
    "right away",
    "right now",
    "asap",
    "as soon as possible",
    "critical",
    "today",
];

/// Outcome of scanning one caller utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSignals {
    /// Dominant sentiment of the utterance.
    pub sentiment: Sentiment,
    /// Distinct positive keyword hits.
    pub positive_hits: usize,
    /// Distinct negative keyword hits.
    pub negative_hits: usize,
    /// Distinct urgency keyword hits.
    pub urgency_hits: usize,
}

impl TextSignals {
    /// Whether the urgency hits are enough to escalate to critical.
    pub fn is_critical(&self) -> bool {
        self.urgency_hits >= URGENCY_CRITICAL_HITS
    }
}

/// Scan one utterance for sentiment and urgency keywords.
pub fn analyze(text: &str) -> TextSignals {
    let lower = text.to_lowercase();

    let positive_hits = hits(&lower, POSITIVE_WORDS);
    let negative_hits = hits(&lower, NEGATIVE_WORDS);
    let urgency_hits = hits(&lower, URGENCY_WORDS);

    let sentiment = match negative_hits.cmp(&positive_hits) {
        std::cmp::Ordering::Greater => Sentiment::Negative,
        std::cmp::Ordering::Less => Sentiment::Positive,
        std::cmp::Ordering::Equal => Sentiment::Neutral,
    };

    TextSignals {
        sentiment,
        positive_hits,
        negative_hits,
        urgency_hits,
    }
}

fn hits(lower: &str, table: &[&str]) -> usize {
    table.iter().filter(|kw| lower.contains(*kw)).count()
}

// ── Tests ───────────────────────────────────────────────────────────────

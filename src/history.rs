//! Append-only conversation history for one call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::CallerProfile;

/// One entry in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    /// A completed caller utterance.
    Caller { text: String, at: DateTime<Utc> },
    /// Text the agent spoke (or attempted to speak).
    Agent { text: String, at: DateTime<Utc> },
    /// A tool invocation and its structured result.
    Tool {
        /// Provider-assigned call id, replayed on later requests.
        id: String,
        name: String,
        arguments: serde_json::Value,
        result: serde_json::Value,
        at: DateTime<Utc>,
    },
}

/// Ordered, append-only sequence of turns.
///
/// The full history is the context for every language-model request. Length
/// is bounded in practice by the session's turn limit, so no trimming
/// happens here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_caller(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::Caller {
            text: text.into(),
            at: Utc::now(),
        });
    }

    pub fn push_agent(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::Agent {
            text: text.into(),
            at: Utc::now(),
        });
    }

    pub fn push_tool(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
        result: serde_json::Value,
    ) {
        self.turns.push(Turn::Tool {
            id: id.into(),
            name: name.into(),
            arguments,
            result,
            at: Utc::now(),
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Human-readable turn log for the transcript record.
    pub fn transcript_text(&self) -> String {
        let mut out = String::new();
        for turn in &self.turns {
            match turn {
                Turn::Caller { text, .. } => {
                    out.push_str("Caller: ");
                    out.push_str(text);
                }
                Turn::Agent { text, .. } => {
                    out.push_str("Agent: ");
                    out.push_str(text);
                }
                Turn::Tool { name, result, .. } => {
                    out.push_str(&format!("[tool {name}: {result}]"));
                }
            }
            out.push('\n');
        }
        out
    }

    /// Short local summary for the transcript record.
    ///
    /// Built from counts and the profile so cleanup never waits on a
    /// network call.
    pub fn summary(&self, profile: &CallerProfile, outcome: &str) -> String {
        let caller_turns = self
            .turns
            .iter()
            .filter(|t| matches!(t, Turn::Caller { .. }))
            .count();

        let mut parts = Vec::new();
        match (&profile.name, &profile.company) {
            (Some(name), Some(company)) => parts.push(format!("Call with {name} ({company})")),
            (Some(name), None) => parts.push(format!("Call with {name}")),
            _ => parts.push("Call with unidentified caller".to_owned()),
        }
        if let Some(reason) = &profile.reason {
            parts.push(format!("reason: {reason}"));
        }
        if let Some(interest) = &profile.service_interest {
            parts.push(format!("interest: {interest}"));
        }
        parts.push(format!(
            "{caller_turns} caller turn{}",
            if caller_turns == 1 { "" } else { "s" }
        ));
        parts.push(format!("sentiment {:?}", profile.sentiment).to_lowercase());
        parts.push(format!("urgency {:?}", profile.urgency).to_lowercase());
        parts.push(format!("outcome: {outcome}"));
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn turns_keep_insertion_order() {
        let mut history = ConversationHistory::new();
        history.push_caller("hello");
        history.push_tool("call_1", "lookup_customer", serde_json::json!({}), serde_json::json!({"found": false}));
        history.push_agent("hi there");

        assert_eq!(history.len(), 3);
        assert!(matches!(history.turns()[0], Turn::Caller { .. }));
        assert!(matches!(history.turns()[1], Turn::Tool { .. }));
        assert!(matches!(history.turns()[2], Turn::Agent { .. }));
    }

    #[test]
    fn transcript_labels_each_speaker() {
        let mut history = ConversationHistory::new();
        history.push_caller("I need a plumber");
        history.push_agent("I can help with that");

        let text = history.transcript_text();
        assert!(text.contains("Caller: I need a plumber"));
        assert!(text.contains("Agent: I can help with that"));
    }

    #[test]
    fn summary_includes_profile_and_outcome() {
        let mut history = ConversationHistory::new();
        history.push_caller("hi");
        history.push_caller("my boiler is broken");

        let mut profile = CallerProfile::default();
        profile.name = Some("Jo".to_owned());
        profile.reason = Some("boiler repair".to_owned());

        let summary = history.summary(&profile, "completed");
        assert!(summary.contains("Jo"));
        assert!(summary.contains("boiler repair"));
        assert!(summary.contains("2 caller turns"));
        assert!(summary.contains("outcome: completed"));
    }

    #[test]
    fn turn_serde_uses_kind_tag() {
        let turn = Turn::Caller {
            text: "hello".to_owned(),
            at: Utc::now(),
        };
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value["kind"], "caller");
        assert_eq!(value["text"], "hello");
    }
}

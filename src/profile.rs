//! Caller profile accumulated over the life of one call.

use serde::{Deserialize, Serialize};

/// How urgently the caller needs attention. Ordered, lowest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

/// Overall tone of the caller so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
}

/// Key fields of a matched customer record.
///
/// A value copy of the directory row's identifying fields, not ownership of
/// the row itself. The directory remains the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRef {
    /// Directory identifier of the matched customer.
    pub id: String,
    /// Display name at match time.
    pub name: String,
}

/// Everything learned about the caller during the call.
///
/// Built incrementally by tool side effects and utterance heuristics, never
/// reset mid-call, and flushed to the store at cleanup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallerProfile {
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    /// The caller's stated reason for calling.
    pub reason: Option<String>,
    /// Service or product the caller asked about.
    pub service_interest: Option<String>,
    /// Preferred callback time, as the caller phrased it.
    pub callback_time: Option<String>,
    /// Requested appointment date/time, as the caller phrased it.
    pub appointment_time: Option<String>,
    pub urgency: Urgency,
    pub sentiment: Sentiment,
    /// Set when the caller asks for a human agent.
    pub wants_human_agent: bool,
    /// Matched historical customer, if a lookup succeeded.
    pub matched_customer: Option<CustomerRef>,
}

impl CallerProfile {
    /// Raise urgency to `level` if it is higher than the current value.
    ///
    /// Urgency never goes back down during a call.
    pub fn escalate_urgency(&mut self, level: Urgency) {
        if level > self.urgency {
            self.urgency = level;
        }
    }

    /// Whether enough identity was gathered to upsert a lead record.
    pub fn has_identity(&self) -> bool {
        self.name.is_some() || self.email.is_some()
    }

    /// Fill a field only when the incoming value is non-empty.
    pub fn set_if_present(slot: &mut Option<String>, value: Option<String>) {
        if let Some(v) = value {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                *slot = Some(trimmed.to_owned());
            }
        }
    }
}

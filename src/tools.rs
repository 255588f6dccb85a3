//! The fixed catalogue of tools the language model may invoke.
//!
//! A closed enumeration rather than open dynamic dispatch: each kind has a
//! stable wire name, a description, a typed argument struct, and a JSON
//! schema published to the model. Execution lives in the orchestrator,
//! which holds the collaborators the handlers need.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::profile::Urgency;

/// Every tool the model can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    TransferToHuman,
    BookAppointment,
    LookupCustomer,
    SendWebhook,
    EndCall,
    CollectInfo,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        ToolKind::TransferToHuman,
        ToolKind::BookAppointment,
        ToolKind::LookupCustomer,
        ToolKind::SendWebhook,
        ToolKind::EndCall,
        ToolKind::CollectInfo,
    ];

    /// Wire name used by the model.
    pub fn name(self) -> &'static str {
        match self {
            ToolKind::TransferToHuman => "transfer_to_human",
            ToolKind::BookAppointment => "book_appointment",
            ToolKind::LookupCustomer => "lookup_customer",
            ToolKind::SendWebhook => "send_webhook",
            ToolKind::EndCall => "end_call",
            ToolKind::CollectInfo => "collect_info",
        }
    }

    /// Resolve a wire name. Unknown names return `None` and are reported
    /// back to the model as an error result.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::TransferToHuman => {
                "Hand the call to a human agent. Use when the caller asks for a person \
                 or the conversation needs human judgment."
            }
            ToolKind::BookAppointment => {
                "Book an appointment for the caller on the calendar. Requires a date and time."
            }
            ToolKind::LookupCustomer => {
                "Look up the caller in the customer directory by email or phone number."
            }
            ToolKind::SendWebhook => {
                "Queue a notification event for back-office systems. Not spoken to the caller."
            }
            ToolKind::EndCall => "Politely end the call after saying goodbye.",
            ToolKind::CollectInfo => {
                "Record details the caller shares: name, email, company, reason for calling, \
                 service interest, preferred callback time, urgency."
            }
        }
    }

    /// JSON schema of the tool's arguments.
    pub fn schema(self) -> Value {
        match self {
            ToolKind::TransferToHuman => json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Why the caller needs a human" }
                },
                "required": []
            }),
            ToolKind::BookAppointment => json!({
                "type": "object",
                "properties": {
                    "date": { "type": "string", "description": "Appointment date, e.g. 2026-09-03" },
                    "time": { "type": "string", "description": "Appointment time, e.g. 14:30" },
                    "name": { "type": "string", "description": "Name to book under" },
                    "service": { "type": "string", "description": "Service requested" }
                },
                "required": ["date", "time"]
            }),
            ToolKind::LookupCustomer => json!({
                "type": "object",
                "properties": {
                    "email": { "type": "string", "description": "Email to search for" },
                    "phone": { "type": "string", "description": "Phone number to search for" }
                },
                "required": []
            }),
            ToolKind::SendWebhook => json!({
                "type": "object",
                "properties": {
                    "event": { "type": "string", "description": "Event name, e.g. qualified_lead" },
                    "payload": { "type": "object", "description": "Event details" }
                },
                "required": ["event"]
            }),
            ToolKind::EndCall => json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Why the call is ending" }
                },
                "required": []
            }),
            ToolKind::CollectInfo => json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "email": { "type": "string" },
                    "company": { "type": "string" },
                    "reason": { "type": "string", "description": "Reason for calling" },
                    "service_interest": { "type": "string" },
                    "callback_time": { "type": "string" },
                    "urgency": {
                        "type": "string",
                        "enum": ["low", "medium", "high", "critical"]
                    }
                },
                "required": []
            }),
        }
    }
}

/// Full tool catalogue in the chat-completions wire shape, sorted by name
/// so request bodies are deterministic.
pub fn catalogue() -> Vec<Value> {
    let mut kinds = ToolKind::ALL;
    kinds.sort_by_key(|kind| kind.name());
    kinds
        .into_iter()
        .map(|kind| {
            json!({
                "type": "function",
                "function": {
                    "name": kind.name(),
                    "description": kind.description(),
                    "parameters": kind.schema(),
                }
            })
        })
        .collect()
}

// ── Typed arguments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransferArgs {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookAppointmentArgs {
    pub date: String,
    pub time: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LookupCustomerArgs {
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendWebhookArgs {
    pub event: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndCallArgs {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CollectInfoArgs {
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub reason: Option<String>,
    pub service_interest: Option<String>,
    pub callback_time: Option<String>,
    pub urgency: Option<String>,
}

impl CollectInfoArgs {
    /// Map the model's urgency string to a profile level.
    ///
    /// Unknown values return `None`; the caller logs and keeps the current
    /// level rather than failing the whole tool call.
    pub fn urgency_level(&self) -> Option<Urgency> {
        match self.urgency.as_deref()?.to_lowercase().as_str() {
            "low" => Some(Urgency::Low),
            "medium" => Some(Urgency::Medium),
            "high" => Some(Urgency::High),
            "critical" => Some(Urgency::Critical),
            _ => None,
        }
    }
}

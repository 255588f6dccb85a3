//! Call records and the persistence collaborators.
//!
//! At cleanup every session produces one [`CallRecord`], one
//! [`TranscriptRecord`], and, when the caller identified themselves, one
//! upserted [`LeadRecord`] keyed by caller address within the tenant.
//! [`FileStore`] is the bundled implementation, one JSON file per record
//! under a configurable root. Deployments with a real CRM or calendar
//! implement the traits themselves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AgentError, Result};
use crate::profile::{CallerProfile, Sentiment, Urgency};

/// How a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// Ran to a normal close (caller hangup or agent end_call).
    Completed,
    /// Handed to a human agent.
    Transferred,
    /// Hit the configured turn ceiling.
    TurnLimit,
    /// Ended by an unrecoverable session error.
    Failed,
}

impl std::fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Completed => "completed",
            Self::Transferred => "transferred",
            Self::TurnLimit => "turn limit reached",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Finalized call metadata, written once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub stream_id: String,
    pub tenant: String,
    pub caller: String,
    pub callee: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub turns: u32,
    pub outcome: CallOutcome,
    pub transferred: bool,
}

/// Full turn log plus summary, written once alongside the call record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub call_id: String,
    pub tenant: String,
    pub transcript: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// Accumulated caller identity, upserted across calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadRecord {
    pub id: String,
    pub tenant: String,
    /// Caller address, the upsert key within the tenant.
    pub caller: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub reason: Option<String>,
    pub service_interest: Option<String>,
    pub urgency: Urgency,
    pub sentiment: Sentiment,
    pub wants_human_agent: bool,
    pub updated_at: DateTime<Utc>,
}

impl LeadRecord {
    /// Build a lead from the profile a call accumulated. Returns `None`
    /// when no identity was gathered, nothing worth upserting.
    pub fn from_profile(tenant: &str, caller: &str, profile: &CallerProfile) -> Option<Self> {
        if !profile.has_identity() {
            return None;
        }
        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant: tenant.to_owned(),
            caller: caller.to_owned(),
            name: profile.name.clone(),
            email: profile.email.clone(),
            company: profile.company.clone(),
            reason: profile.reason.clone(),
            service_interest: profile.service_interest.clone(),
            urgency: profile.urgency,
            sentiment: profile.sentiment,
            wants_human_agent: profile.wants_human_agent,
            updated_at: Utc::now(),
        })
    }

    /// Fold an earlier record into this one. Known fields win over blanks,
    /// urgency never downgrades, the stable id survives.
    fn absorb(mut self, earlier: LeadRecord) -> Self {
        self.id = earlier.id;
        self.name = self.name.or(earlier.name);
        self.email = self.email.or(earlier.email);
        self.company = self.company.or(earlier.company);
        self.reason = self.reason.or(earlier.reason);
        self.service_interest = self.service_interest.or(earlier.service_interest);
        self.urgency = self.urgency.max(earlier.urgency);
        self.wants_human_agent = self.wants_human_agent || earlier.wants_human_agent;
        self
    }
}

/// A known customer, as returned by directory lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// A booking request assembled from tool arguments plus call context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentRequest {
    pub tenant: String,
    pub caller: String,
    pub date: String,
    pub time: String,
    pub name: Option<String>,
    pub service: Option<String>,
}

/// A confirmed booking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub date: String,
    pub time: String,
}

// ── Collaborator seams ──────────────────────────────────────────────────

/// Where finalized call artifacts go.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn save_call(&self, record: &CallRecord) -> Result<()>;
    async fn save_transcript(&self, record: &TranscriptRecord) -> Result<()>;
    /// Insert or merge a lead keyed by caller address within the tenant.
    async fn upsert_lead(&self, record: LeadRecord) -> Result<()>;
}

/// Booking backend for the appointment tool.
#[async_trait]
pub trait Calendar: Send + Sync {
    async fn book(&self, request: &AppointmentRequest) -> Result<Appointment>;
}

/// Historical customer lookup for the lookup tool.
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn find(
        &self,
        tenant: &str,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<CustomerRecord>>;
}

// ── File-backed implementation ──────────────────────────────────────────

const CALLS_DIR: &str = "calls";
const TRANSCRIPTS_DIR: &str = "transcripts";
const LEADS_DIR: &str = "leads";
const APPOINTMENTS_DIR: &str = "appointments";

/// JSON-file store for local deployments. Implements every persistence
/// seam: leads double as the customer directory, so returning callers are
/// recognized across calls.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn write_json<T: Serialize>(&self, relative: &Path, value: &T) -> Result<()> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::Store(format!("create {}: {e}", parent.display())))?;
        }
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| AgentError::Store(format!("serialize {}: {e}", path.display())))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| AgentError::Store(format!("write {}: {e}", path.display())))
    }

    fn lead_path(&self, tenant: &str, caller: &str) -> PathBuf {
        Path::new(LEADS_DIR)
            .join(sanitize(tenant))
            .join(format!("{}.json", sanitize(caller)))
    }

    async fn read_lead(&self, tenant: &str, caller: &str) -> Option<LeadRecord> {
        let path = self.root.join(self.lead_path(tenant, caller));
        let body = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice(&body) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("unreadable lead at {}: {e}", path.display());
                None
            }
        }
    }
}

#[async_trait]
impl CallStore for FileStore {
    async fn save_call(&self, record: &CallRecord) -> Result<()> {
        let relative = Path::new(CALLS_DIR).join(format!("{}.json", sanitize(&record.call_id)));
        self.write_json(&relative, record).await
    }

    async fn save_transcript(&self, record: &TranscriptRecord) -> Result<()> {
        let relative =
            Path::new(TRANSCRIPTS_DIR).join(format!("{}.json", sanitize(&record.call_id)));
        self.write_json(&relative, record).await
    }

    async fn upsert_lead(&self, record: LeadRecord) -> Result<()> {
        let merged = match self.read_lead(&record.tenant, &record.caller).await {
            Some(earlier) => record.absorb(earlier),
            None => record,
        };
        let relative = self.lead_path(&merged.tenant, &merged.caller);
        self.write_json(&relative, &merged).await
    }
}

#[async_trait]
impl Calendar for FileStore {
    async fn book(&self, request: &AppointmentRequest) -> Result<Appointment> {
        let appointment = Appointment {
            id: uuid::Uuid::new_v4().to_string(),
            date: request.date.clone(),
            time: request.time.clone(),
        };
        let relative = Path::new(APPOINTMENTS_DIR).join(format!("{}.json", appointment.id));
        let body = serde_json::json!({ "request": request, "appointment": appointment });
        self.write_json(&relative, &body).await?;
        Ok(appointment)
    }
}

#[async_trait]
impl CustomerDirectory for FileStore {
    async fn find(
        &self,
        tenant: &str,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<CustomerRecord>> {
        if email.is_none() && phone.is_none() {
            return Ok(None);
        }
        let dir = self.root.join(LEADS_DIR).join(sanitize(tenant));
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(None), // No leads for this tenant yet.
        };
        let wanted_email = email.map(str::to_ascii_lowercase);
        let wanted_phone = phone.map(digits);
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(body) = tokio::fs::read(entry.path()).await else {
                continue;
            };
            let Ok(lead) = serde_json::from_slice::<LeadRecord>(&body) else {
                continue;
            };
            let email_hit = match (&wanted_email, &lead.email) {
                (Some(wanted), Some(have)) => wanted == &have.to_ascii_lowercase(),
                _ => false,
            };
            let phone_hit = wanted_phone
                .as_ref()
                .is_some_and(|wanted| !wanted.is_empty() && *wanted == digits(&lead.caller));
            if email_hit || phone_hit {
                return Ok(Some(CustomerRecord {
                    id: lead.id,
                    name: lead.name,
                    email: lead.email,
                    phone: Some(lead.caller),
                }));
            }
        }
        Ok(None)
    }
}

/// Keep address-safe characters, replace the rest so records never escape
/// their directory.
fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '+' | '@' | '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_owned()
    } else {
        cleaned
    }
}

fn digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

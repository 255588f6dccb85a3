//! Outbound webhook notifications.
//!
//! The `send_webhook` tool only queues. Delivery happens at session
//! cleanup so a slow endpoint can never stall the conversation, and a
//! failed delivery costs a warning, not the call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::WebhookConfig;
use crate::error::{AgentError, Result};

/// One queued notification.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookJob {
    pub event: String,
    pub call_id: String,
    pub tenant: String,
    pub payload: serde_json::Value,
    pub queued_at: DateTime<Utc>,
}

/// Session-scoped job queue. Push from tool handlers, drain at cleanup.
#[derive(Debug, Default)]
pub struct WebhookQueue {
    jobs: Mutex<Vec<WebhookJob>>,
}

impl WebhookQueue {
    pub fn push(&self, job: WebhookJob) {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job);
    }

    pub fn drain(&self) -> Vec<WebhookJob> {
        std::mem::take(&mut *self.jobs.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delivery seam.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, job: &WebhookJob) -> Result<()>;
}

/// POSTs each job as JSON to the configured endpoint. Without an endpoint
/// configured, jobs are logged and dropped.
pub struct HttpNotifier {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn deliver(&self, job: &WebhookJob) -> Result<()> {
        let Some(endpoint) = self.config.endpoint.as_deref() else {
            tracing::debug!(event = %job.event, "no webhook endpoint configured, dropping job");
            return Ok(());
        };
        let request = self.client.post(endpoint).json(job).send();
        let response = tokio::time::timeout(Duration::from_secs(self.config.timeout_s), request)
            .await
            .map_err(|_| {
                AgentError::Tool(format!(
                    "webhook timed out after {}s",
                    self.config.timeout_s
                ))
            })?
            .map_err(|e| AgentError::Tool(format!("webhook delivery failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AgentError::Tool(format!(
                "webhook endpoint answered HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

/// Deliver everything queued, logging failures instead of propagating
/// them. Runs once per session, at cleanup.
pub async fn flush(queue: &WebhookQueue, notifier: &dyn Notifier) {
    let jobs = queue.drain();
    if jobs.is_empty() {
        return;
    }
    tracing::info!(count = jobs.len(), "delivering queued webhooks");
    for job in jobs {
        if let Err(e) = notifier.deliver(&job).await {
            tracing::warn!(event = %job.event, "webhook not delivered: {e}");
        }
    }
}

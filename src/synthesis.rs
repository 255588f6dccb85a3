//! Streaming text-to-speech client.
//!
//! One HTTP request per agent line. The service streams raw linear16 PCM
//! back as it synthesizes, so playback can start before the full clip
//! exists. Sample rate and voice come from [`SynthesisConfig`].

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use serde_json::json;
use std::pin::Pin;
use std::time::Duration;

use crate::config::SynthesisConfig;
use crate::error::{AgentError, Result};

/// PCM byte chunks as the service produces them.
pub type SpeechStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Turns agent text into audio. A trait seam so playback is testable
/// with canned PCM.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Start synthesizing `text`, returning the PCM stream.
    async fn stream_speech(&self, text: &str) -> Result<SpeechStream>;
}

/// HTTP synthesis client.
pub struct SynthesisClient {
    config: SynthesisConfig,
    client: reqwest::Client,
}

impl std::fmt::Debug for SynthesisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisClient")
            .field("voice", &self.config.voice)
            .field("sample_rate", &self.config.sample_rate)
            .finish_non_exhaustive()
    }
}

impl SynthesisClient {
    pub fn new(config: SynthesisConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn speak_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.config.base_url)
            .map_err(|e| AgentError::Synthesis(format!("bad base url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("model", &self.config.voice)
            .append_pair("encoding", "linear16")
            .append_pair("sample_rate", &self.config.sample_rate.to_string())
            .append_pair("container", "none");
        Ok(url)
    }
}

#[async_trait]
impl SpeechSynthesizer for SynthesisClient {
    async fn stream_speech(&self, text: &str) -> Result<SpeechStream> {
        let url = self.speak_url()?;
        let request = self
            .client
            .post(url)
            .header("Authorization", format!("Token {}", self.config.api_key))
            .json(&json!({ "text": text }))
            .send();

        // The timeout covers connect and response headers. The body keeps
        // streaming for as long as playback consumes it.
        let response = tokio::time::timeout(Duration::from_secs(self.config.timeout_s), request)
            .await
            .map_err(|_| {
                AgentError::Synthesis(format!(
                    "request timed out after {}s",
                    self.config.timeout_s
                ))
            })?
            .map_err(|e| AgentError::Synthesis(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| AgentError::Synthesis(format!("stream error: {e}"))));
        Ok(Box::pin(stream))
    }
}

fn map_http_error(status: StatusCode, body: &str) -> AgentError {
    let detail = extract_error_message(body);
    match status.as_u16() {
        401 | 403 => AgentError::Synthesis(format!("authentication failed: {detail}")),
        429 => AgentError::Synthesis(format!("rate limited: {detail}")),
        code => AgentError::Synthesis(format!("HTTP {code}: {detail}")),
    }
}

/// Pull a readable message out of an error body, falling back to the raw
/// text when the shape is unfamiliar.
fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for path in [&["err_msg"][..], &["error", "message"][..], &["message"][..]] {
            let mut cursor = &value;
            for key in path {
                match cursor.get(key) {
                    Some(next) => cursor = next,
                    None => {
                        cursor = &serde_json::Value::Null;
                        break;
                    }
                }
            }
            if let Some(message) = cursor.as_str() {
                return message.to_owned();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no error detail".to_owned()
    } else {
        trimmed.chars().take(200).collect()
    }
}

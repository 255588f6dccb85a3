//! OpenAI-compatible chat-completions adapter.
//!
//! Non-streaming: a phone turn needs the whole reply before synthesis
//! starts, so there is nothing to gain from SSE here. Tool-call turns are
//! replayed into later requests as assistant/tool message pairs.

use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use crate::history::{ConversationHistory, Turn};
use crate::tools;

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    /// Provider-assigned id, echoed back with the result.
    pub id: String,
    pub name: String,
    /// Raw JSON argument string as the model produced it.
    pub arguments: String,
}

/// What the model answered with.
#[derive(Debug, Clone, Default)]
pub struct ModelReply {
    /// Direct assistant text, if any.
    pub text: Option<String>,
    /// Tool invocations in the order the model returned them.
    pub tool_calls: Vec<ToolCall>,
}

/// Chat-completions client bound to one provider configuration.
pub struct ChatClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("model", &self.config.model)
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

impl ChatClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::new();
        Self { config, client }
    }

    /// Send the conversation and get one reply.
    ///
    /// `offer_tools` controls whether the tool catalogue rides along; the
    /// follow-up call after tool execution omits it so the model must
    /// answer with speakable text.
    ///
    /// # Errors
    ///
    /// Returns an LLM error on transport failure, non-success status,
    /// timeout, or an unparseable response body.
    pub async fn respond(
        &self,
        history: &ConversationHistory,
        offer_tools: bool,
    ) -> Result<ModelReply> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let body = self.build_request(history, offer_tools);

        let fut = async {
            let response = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.config.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| AgentError::Llm(format!("request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body_text = response.text().await.unwrap_or_default();
                return Err(map_http_error(status, &body_text));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| AgentError::Llm(format!("invalid response body: {e}")))?;
            Ok(parsed)
        };

        let parsed = tokio::time::timeout(Duration::from_secs(self.config.timeout_s), fut)
            .await
            .map_err(|_| {
                AgentError::Llm(format!(
                    "no response within {}s from {}",
                    self.config.timeout_s, self.config.model
                ))
            })??;

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(AgentError::Llm("response carried no choices".to_owned()));
        };

        let text = choice
            .message
            .content
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty());
        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        Ok(ModelReply { text, tool_calls })
    }

    fn build_request(&self, history: &ConversationHistory, offer_tools: bool) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": build_messages(&self.config.system_prompt, history),
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });
        if offer_tools {
            body["tools"] = Value::Array(tools::catalogue());
        }
        body
    }
}

/// Convert the turn log into chat-completions messages.
///
/// Each tool turn replays as an assistant message carrying the original
/// call followed by the matching tool-result message.
fn build_messages(system_prompt: &str, history: &ConversationHistory) -> Vec<Value> {
    let mut messages = vec![json!({"role": "system", "content": system_prompt})];
    for turn in history.turns() {
        match turn {
            Turn::Caller { text, .. } => {
                messages.push(json!({"role": "user", "content": text}));
            }
            Turn::Agent { text, .. } => {
                messages.push(json!({"role": "assistant", "content": text}));
            }
            Turn::Tool {
                id,
                name,
                arguments,
                result,
                ..
            } => {
                messages.push(json!({
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": arguments.to_string(),
                        }
                    }]
                }));
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "content": result.to_string(),
                }));
            }
        }
    }
    messages
}

/// Map an HTTP error status to a crate error.
fn map_http_error(status: reqwest::StatusCode, body: &str) -> AgentError {
    let message = extract_error_message(body);
    match status.as_u16() {
        401 => AgentError::Llm(format!("authentication failed: {message}")),
        429 => AgentError::Llm(format!("rate limited: {message}")),
        _ => AgentError::Llm(format!("HTTP {}: {message}", status.as_u16())),
    }
}

/// Extract an error message from a provider error response body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned())
}

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

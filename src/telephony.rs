//! Telephony media-stream wire messages and collaborator seams.
//!
//! The call leg arrives as a WebSocket of JSON messages in the Twilio
//! media-stream shape: `start` announces the call, `media` carries base64
//! mu-law audio both ways, `mark` confirms playback progress, `stop` ends
//! the stream. Everything the rest of the crate needs from the telephony
//! provider goes through the [`MediaSink`] and [`TelephonyControl`] traits.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{AgentError, Result};

/// One inbound message from the media WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundMessage {
    /// Protocol handshake, sent once before `start`.
    Connected,
    /// Call metadata. Everything after this belongs to one stream.
    Start { start: StartMeta },
    /// A chunk of caller audio.
    Media { media: MediaFrame },
    /// Playback progress confirmation for a mark we sent.
    Mark { mark: MarkEvent },
    /// The stream is over. No further messages arrive.
    Stop,
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Parse a WebSocket text frame. Unparseable frames return `None`.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!("discarding unparseable media message: {e}");
                None
            }
        }
    }
}

/// Payload of the `start` message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    pub stream_sid: String,
    pub call_sid: String,
    #[serde(default)]
    pub account_sid: String,
    /// Caller-defined key/value pairs set up at call connect time. The
    /// caller and callee addresses arrive here as `from` and `to`.
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

/// Payload of a `media` message.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaFrame {
    /// Base64-encoded mu-law audio.
    pub payload: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Payload of a `mark` message.
#[derive(Debug, Clone, Deserialize)]
pub struct MarkEvent {
    pub name: String,
}

/// Identity of one call, derived from the `start` message.
#[derive(Debug, Clone, Default)]
pub struct CallInfo {
    pub call_id: String,
    pub stream_id: String,
    pub caller: String,
    pub callee: String,
    /// Owning tenant, the telephony account the stream belongs to.
    pub tenant: String,
}

impl CallInfo {
    pub fn from_start(start: &StartMeta) -> Self {
        let param = |key: &str| start.custom_parameters.get(key).cloned().unwrap_or_default();
        Self {
            call_id: start.call_sid.clone(),
            stream_id: start.stream_sid.clone(),
            caller: param("from"),
            callee: param("to"),
            tenant: start.account_sid.clone(),
        }
    }
}

// ── Outbound messages ───────────────────────────────────────────────────

/// Audio toward the caller.
pub fn media_message(stream_sid: &str, payload_b64: &str) -> String {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": payload_b64 },
    })
    .to_string()
}

/// Named checkpoint echoed back by the provider once every frame queued
/// before it has played out.
pub fn mark_message(stream_sid: &str, name: &str) -> String {
    json!({
        "event": "mark",
        "streamSid": stream_sid,
        "mark": { "name": name },
    })
    .to_string()
}

/// Drop any audio the provider has buffered but not yet played.
pub fn clear_message(stream_sid: &str) -> String {
    json!({
        "event": "clear",
        "streamSid": stream_sid,
    })
    .to_string()
}

// ── Collaborator seams ──────────────────────────────────────────────────

/// Outbound half of the media stream.
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Queue one base64 mu-law frame toward the caller.
    async fn send_audio(&self, payload_b64: &str) -> Result<()>;

    /// Queue a named completion mark after previously queued audio.
    async fn send_mark(&self, name: &str) -> Result<()>;

    /// Discard audio buffered on the provider side.
    async fn clear(&self) -> Result<()>;
}

/// Control-plane operations on the call leg.
#[async_trait]
pub trait TelephonyControl: Send + Sync {
    /// Redirect the call leg away from this agent, to a human target.
    async fn redirect(&self, call_id: &str, target: &str) -> Result<()>;
}

/// [`MediaSink`] writing serialized messages into a channel drained by the
/// WebSocket task.
pub struct ChannelMediaSink {
    stream_sid: String,
    outbound: mpsc::UnboundedSender<String>,
}

impl ChannelMediaSink {
    pub fn new(stream_sid: String, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            stream_sid,
            outbound,
        }
    }

    fn push(&self, message: String) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| AgentError::Telephony("media channel closed".to_owned()))
    }
}

#[async_trait]
impl MediaSink for ChannelMediaSink {
    async fn send_audio(&self, payload_b64: &str) -> Result<()> {
        self.push(media_message(&self.stream_sid, payload_b64))
    }

    async fn send_mark(&self, name: &str) -> Result<()> {
        self.push(mark_message(&self.stream_sid, name))
    }

    async fn clear(&self) -> Result<()> {
        self.push(clear_message(&self.stream_sid))
    }
}

/// [`TelephonyControl`] that hands redirects to the deployment's
/// call-control handler over HTTP. Provider signaling lives behind that
/// handler; this side only tells it which call to move.
pub struct HttpRedirectControl {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRedirectControl {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: REDIRECT_TIMEOUT,
        }
    }
}

impl Default for HttpRedirectControl {
    fn default() -> Self {
        Self::new()
    }
}

const REDIRECT_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
impl TelephonyControl for HttpRedirectControl {
    async fn redirect(&self, call_id: &str, target: &str) -> Result<()> {
        if !target.starts_with("http://") && !target.starts_with("https://") {
            return Err(AgentError::Telephony(format!(
                "transfer target {target} is not an http(s) call-control handler"
            )));
        }
        let body = json!({ "call_id": call_id, "action": "redirect" });
        let send = self.client.post(target).json(&body).send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| AgentError::Telephony("redirect request timed out".to_owned()))?
            .map_err(|e| AgentError::Telephony(format!("redirect request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AgentError::Telephony(format!(
                "redirect handler returned {}",
                response.status()
            )));
        }
        tracing::info!(call_id = %call_id, "call redirected to a human");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn parses_start_with_custom_parameters() {
        let text = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "start": {
                "accountSid": "AC00",
                "callSid": "CA01",
                "streamSid": "MZ02",
                "tracks": ["inbound"],
                "customParameters": {"from": "+15550100", "to": "+15550199"}
            },
            "streamSid": "MZ02"
        }"#;
        let message = InboundMessage::parse(text).unwrap();
        let InboundMessage::Start { start } = message else {
            panic!("expected start, got {message:?}");
        };
        let info = CallInfo::from_start(&start);
        assert_eq!(info.call_id, "CA01");
        assert_eq!(info.stream_id, "MZ02");
        assert_eq!(info.caller, "+15550100");
        assert_eq!(info.callee, "+15550199");
        assert_eq!(info.tenant, "AC00");
    }

    #[test]
    fn parses_media_mark_and_stop() {
        let media = InboundMessage::parse(
            r#"{"event":"media","media":{"track":"inbound","chunk":"2","timestamp":"180","payload":"//8A"},"streamSid":"MZ02"}"#,
        )
        .unwrap();
        assert!(matches!(
            media,
            InboundMessage::Media { ref media } if media.payload == "//8A"
        ));

        let mark = InboundMessage::parse(
            r#"{"event":"mark","mark":{"name":"reply-3"},"streamSid":"MZ02"}"#,
        )
        .unwrap();
        assert!(matches!(
            mark,
            InboundMessage::Mark { ref mark } if mark.name == "reply-3"
        ));

        let stop = InboundMessage::parse(
            r#"{"event":"stop","stop":{"callSid":"CA01"},"streamSid":"MZ02"}"#,
        )
        .unwrap();
        assert!(matches!(stop, InboundMessage::Stop));
    }

    #[test]
    fn unknown_events_are_tolerated() {
        assert!(matches!(
            InboundMessage::parse(r#"{"event":"dtmf","dtmf":{"digit":"5"}}"#),
            Some(InboundMessage::Unknown)
        ));
        assert!(InboundMessage::parse("{broken").is_none());
    }

    #[test]
    fn outbound_messages_have_the_wire_shape() {
        let media: serde_json::Value =
            serde_json::from_str(&media_message("MZ02", "AAEC")).unwrap();
        assert_eq!(media["event"], "media");
        assert_eq!(media["streamSid"], "MZ02");
        assert_eq!(media["media"]["payload"], "AAEC");

        let mark: serde_json::Value = serde_json::from_str(&mark_message("MZ02", "m1")).unwrap();
        assert_eq!(mark["event"], "mark");
        assert_eq!(mark["mark"]["name"], "m1");

        let clear: serde_json::Value = serde_json::from_str(&clear_message("MZ02")).unwrap();
        assert_eq!(clear["event"], "clear");
        assert!(clear.get("media").is_none());
    }

    #[tokio::test]
    async fn channel_sink_serializes_onto_the_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ChannelMediaSink::new("MZ02".to_owned(), tx);

        sink.send_audio("AAEC").await.unwrap();
        sink.send_mark("m1").await.unwrap();
        sink.clear().await.unwrap();

        let audio: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(audio["event"], "media");
        let mark: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(mark["event"], "mark");
        let clear: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(clear["event"], "clear");

        drop(rx);
        assert!(sink.clear().await.is_err());
    }

    #[tokio::test]
    async fn redirect_posts_the_call_id_to_the_handler() {
        use wiremock::matchers::{body_partial_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/calls/redirect"))
            .and(body_partial_json(json!({"call_id": "CA01"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let control = HttpRedirectControl::new();
        let target = format!("{}/calls/redirect", server.uri());
        control.redirect("CA01", &target).await.unwrap();
    }

    #[tokio::test]
    async fn redirect_rejects_targets_without_a_handler() {
        let control = HttpRedirectControl::new();
        let err = control.redirect("CA01", "tel:+15550123").await.unwrap_err();
        assert!(err.to_string().contains("call-control handler"));
    }
}

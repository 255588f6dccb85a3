//! Live link to the speech recognition service.
//!
//! One WebSocket per call: telephony mu-law audio goes up as binary
//! frames, transcript events come back as JSON. The link owns its socket
//! on a background task, forwards parsed events to the session, sends
//! keepalives while the caller is quiet, and retries the connection once
//! before declaring itself closed.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;

use crate::audio::TELEPHONY_RATE;
use crate::config::RecognitionConfig;
use crate::error::{AgentError, Result};
use crate::messages::{RecognitionEvent, SessionEvent};

/// Inbound audio buffered toward the socket. At 20 ms frames this is a
/// little over five seconds.
const AUDIO_CHANNEL_SIZE: usize = 256;

/// Delay before the single reconnect attempt.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Where the session pushes caller audio.
///
/// A trait seam so sessions are testable without a recognizer on the
/// network.
#[async_trait]
pub trait RecognitionLink: Send + Sync {
    /// Forward one telephony audio frame.
    async fn send_audio(&self, frame: Bytes) -> Result<()>;

    /// Close the link. Idempotent.
    fn close(&self);
}

/// WebSocket-backed link.
pub struct WsRecognitionLink {
    audio_tx: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
}

impl WsRecognitionLink {
    /// Spawn the link task. Events arrive on `events` wrapped as
    /// [`SessionEvent::Recognition`].
    pub fn spawn(config: RecognitionConfig, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_SIZE);
        let shutdown = CancellationToken::new();

        tokio::spawn(run_link(config, audio_rx, events, shutdown.clone()));

        Self {
            audio_tx,
            shutdown,
        }
    }
}

#[async_trait]
impl RecognitionLink for WsRecognitionLink {
    async fn send_audio(&self, frame: Bytes) -> Result<()> {
        self.audio_tx
            .send(frame)
            .await
            .map_err(|_| AgentError::Channel("recognition link is closed".to_owned()))
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Build the live-transcription URL with the streaming parameters the
/// telephony leg requires.
fn listen_url(config: &RecognitionConfig) -> Result<url::Url> {
    let mut url = url::Url::parse(&config.base_url)
        .map_err(|e| AgentError::Recognition(format!("bad base url: {e}")))?;
    url.query_pairs_mut()
        .append_pair("model", &config.model)
        .append_pair("language", &config.language)
        .append_pair("encoding", "mulaw")
        .append_pair("sample_rate", &TELEPHONY_RATE.to_string())
        .append_pair("channels", "1")
        .append_pair("interim_results", "true")
        .append_pair("endpointing", "300")
        .append_pair("utterance_end_ms", "1000")
        .append_pair("vad_events", "true");
    Ok(url)
}

async fn run_link(
    config: RecognitionConfig,
    mut audio_rx: mpsc::Receiver<Bytes>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
) {
    let mut attempt = 0u32;
    loop {
        match run_socket(&config, &mut audio_rx, &events, &shutdown).await {
            SocketExit::Shutdown => break,
            SocketExit::Dropped(reason) if attempt == 0 => {
                tracing::warn!("recognition link dropped ({reason}), reconnecting");
                attempt += 1;
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            SocketExit::Dropped(reason) => {
                tracing::error!("recognition link lost: {reason}");
                let _ = events.send(SessionEvent::Recognition(RecognitionEvent::Closed));
                break;
            }
        }
    }
}

enum SocketExit {
    /// The session asked us to stop.
    Shutdown,
    /// The socket failed or the server went away.
    Dropped(String),
}

async fn run_socket(
    config: &RecognitionConfig,
    audio_rx: &mut mpsc::Receiver<Bytes>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    shutdown: &CancellationToken,
) -> SocketExit {
    let url = match listen_url(config) {
        Ok(url) => url,
        Err(e) => return SocketExit::Dropped(e.to_string()),
    };
    let mut request = match url.as_str().into_client_request() {
        Ok(req) => req,
        Err(e) => return SocketExit::Dropped(format!("bad request: {e}")),
    };
    let auth = match HeaderValue::from_str(&format!("Token {}", config.api_key)) {
        Ok(value) => value,
        Err(e) => return SocketExit::Dropped(format!("bad api key: {e}")),
    };
    request.headers_mut().insert("Authorization", auth);

    let (ws_stream, _) = match tokio_tungstenite::connect_async(request).await {
        Ok(ok) => ok,
        Err(e) => return SocketExit::Dropped(format!("connect: {e}")),
    };
    tracing::info!(model = %config.model, "recognition link connected");
    let (mut write, mut read) = ws_stream.split();

    let mut keepalive = tokio::time::interval(Duration::from_secs(config.keepalive_interval_s.max(1)));
    keepalive.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = write.send(Message::Text(r#"{"type":"CloseStream"}"#.into())).await;
                let _ = write.close().await;
                return SocketExit::Shutdown;
            }
            frame = audio_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = write.send(Message::Binary(frame.to_vec())).await {
                            return SocketExit::Dropped(format!("send: {e}"));
                        }
                        keepalive.reset();
                    }
                    // The session dropped its handle.
                    None => return SocketExit::Shutdown,
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = parse_event(&text) {
                            let _ = events.send(SessionEvent::Recognition(event));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SocketExit::Dropped("closed by server".to_owned());
                    }
                    Some(Err(e)) => return SocketExit::Dropped(format!("read: {e}")),
                    _ => {} // Binary, Ping/Pong frames handled by tungstenite.
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = write.send(Message::Text(r#"{"type":"KeepAlive"}"#.into())).await {
                    return SocketExit::Dropped(format!("keepalive: {e}"));
                }
            }
        }
    }
}

/// Parse one service event. Unknown or empty events return `None`.
fn parse_event(text: &str) -> Option<RecognitionEvent> {
    let wire: WireEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("discarding unparseable recognition event: {e}");
            return None;
        }
    };

    match wire {
        WireEvent::Results {
            channel,
            is_final,
            speech_final,
        } => {
            let alternative = channel.alternatives.into_iter().next()?;
            if alternative.transcript.trim().is_empty() {
                // Quiet periods produce empty results continuously.
                tracing::trace!("empty transcript discarded");
                return None;
            }
            Some(RecognitionEvent::Transcript {
                text: alternative.transcript,
                is_final,
                speech_final,
                confidence: alternative.confidence,
            })
        }
        WireEvent::SpeechStarted => Some(RecognitionEvent::SpeechStarted),
        WireEvent::UtteranceEnd => Some(RecognitionEvent::UtteranceEnd),
        WireEvent::Metadata | WireEvent::Unknown => None,
    }
}

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireEvent {
    Results {
        channel: WireChannel,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
    },
    SpeechStarted,
    UtteranceEnd,
    Metadata,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    #[serde(default)]
    alternatives: Vec<WireAlternative>,
}

#[derive(Debug, Deserialize)]
struct WireAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn parses_final_transcript_event() {
        let text = r#"{
            "type": "Results",
            "is_final": true,
            "speech_final": true,
            "channel": {"alternatives": [{"transcript": "hello there", "confidence": 0.97}]}
        }"#;
        let event = parse_event(text).unwrap();
        assert_eq!(
            event,
            RecognitionEvent::Transcript {
                text: "hello there".to_owned(),
                is_final: true,
                speech_final: true,
                confidence: Some(0.97),
            }
        );
    }

    #[test]
    fn parses_out_of_band_signals() {
        assert_eq!(
            parse_event(r#"{"type": "SpeechStarted", "timestamp": 1.5}"#),
            Some(RecognitionEvent::SpeechStarted)
        );
        assert_eq!(
            parse_event(r#"{"type": "UtteranceEnd", "last_word_end": 2.1}"#),
            Some(RecognitionEvent::UtteranceEnd)
        );
    }

    #[test]
    fn empty_transcripts_are_discarded() {
        let text = r#"{
            "type": "Results",
            "is_final": false,
            "channel": {"alternatives": [{"transcript": "  "}]}
        }"#;
        assert_eq!(parse_event(text), None);
    }

    #[test]
    fn unknown_and_malformed_events_are_discarded() {
        assert_eq!(parse_event(r#"{"type": "Metadata", "duration": 4}"#), None);
        assert_eq!(parse_event(r#"{"type": "SomethingNew"}"#), None);
        assert_eq!(parse_event("not json at all"), None);
    }

    #[test]
    fn listen_url_carries_telephony_parameters() {
        let config = RecognitionConfig::default();
        let url = listen_url(&config).unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("encoding=mulaw"));
        assert!(query.contains("sample_rate=8000"));
        assert!(query.contains("interim_results=true"));
        assert!(query.contains("vad_events=true"));
    }
}

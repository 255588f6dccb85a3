//! WebSocket ingress for telephony media streams.
//!
//! One route, `/media`, accepts the provider's stream. Each socket hosts
//! at most one call: the `start` message names it, a session is built
//! around it, and from then on this task only shovels frames. Inbound
//! text goes to the session; outbound messages queued by the media sink
//! are drained back onto the socket. Every decision about the call is the
//! session's.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::AgentConfig;
use crate::llm::ChatClient;
use crate::messages::SessionEvent;
use crate::orchestrator::DialogueOrchestrator;
use crate::persistence::FileStore;
use crate::player::SpeechPlayer;
use crate::recognition::WsRecognitionLink;
use crate::session::{CallSession, SessionContext, SessionHandle};
use crate::synthesis::SynthesisClient;
use crate::telephony::{
    CallInfo, ChannelMediaSink, HttpRedirectControl, InboundMessage, StartMeta, TelephonyControl,
};
use crate::webhook::{HttpNotifier, Notifier, WebhookQueue};

/// How long a finished stream waits for its session to persist and settle.
const SESSION_SETTLE: Duration = Duration::from_secs(10);

/// State shared across media connections.
#[derive(Clone)]
pub struct AppState {
    config: Arc<AgentConfig>,
    store: Arc<FileStore>,
    control: Arc<dyn TelephonyControl>,
    notifier: Arc<dyn Notifier>,
}

impl AppState {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        let store = Arc::new(FileStore::new(config.persistence.records_dir.clone()));
        let notifier = Arc::new(HttpNotifier::new(config.webhook.clone()));
        Self {
            config,
            store,
            control: Arc::new(HttpRedirectControl::new()),
            notifier,
        }
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/media", get(media_upgrade))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn media_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

/// Drive one media socket from accept to close.
async fn handle_stream(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Nothing can happen before `start` names the call.
    let Some(start) = await_start(&mut ws_rx).await else {
        tracing::debug!("socket closed before a start message");
        return;
    };
    tracing::info!(
        call_id = %start.call_sid,
        stream_id = %start.stream_sid,
        "media stream started"
    );

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (handle, session) = build_session(&state, &start, outbound_tx);

    loop {
        tokio::select! {
            queued = outbound_rx.recv() => {
                // `None` means the session and its playback tasks are gone.
                let Some(text) = queued else { break };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    tracing::debug!("media socket went away mid-send");
                    break;
                }
            }
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => dispatch(&handle, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("media socket error: {e}");
                    break;
                }
            },
        }
    }

    // Whichever side ended the stream, let the session settle and persist.
    let _ = handle.event(SessionEvent::MediaClosed);
    if tokio::time::timeout(SESSION_SETTLE, session).await.is_err() {
        tracing::warn!("session still settling after stream close, detaching");
    }
}

/// Wait for the `start` message that names the call.
async fn await_start(ws_rx: &mut SplitStream<WebSocket>) -> Option<StartMeta> {
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match InboundMessage::parse(&text) {
                Some(InboundMessage::Start { start }) => return Some(start),
                Some(InboundMessage::Stop) => return None,
                // `connected` always precedes `start`; media cannot be
                // routed before the call has a session.
                _ => {}
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("media socket error before start: {e}");
                return None;
            }
        }
    }
    None
}

/// Route one parsed inbound message to the session.
async fn dispatch(handle: &SessionHandle, text: &str) {
    match InboundMessage::parse(text) {
        Some(InboundMessage::Media { media }) => match STANDARD.decode(media.payload.as_bytes()) {
            // Send failures mean the recognition link already closed
            // (wind-down); remaining caller audio is dropped.
            Ok(frame) => {
                let _ = handle.audio(Bytes::from(frame)).await;
            }
            Err(e) => tracing::warn!("discarding undecodable media payload: {e}"),
        },
        Some(InboundMessage::Mark { mark }) => {
            let _ = handle.event(SessionEvent::MarkReceived { name: mark.name });
        }
        Some(InboundMessage::Stop) => {
            let _ = handle.event(SessionEvent::MediaClosed);
        }
        Some(InboundMessage::Start { .. }) => {
            tracing::warn!("duplicate start message ignored");
        }
        Some(InboundMessage::Connected) | Some(InboundMessage::Unknown) | None => {}
    }
}

/// Assemble the per-call collaborators and spawn the session.
fn build_session(
    state: &AppState,
    start: &StartMeta,
    outbound_tx: mpsc::UnboundedSender<String>,
) -> (SessionHandle, tokio::task::JoinHandle<()>) {
    let config = state.config.clone();
    let call = CallInfo::from_start(start);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let recognition = Arc::new(WsRecognitionLink::spawn(
        config.recognition.clone(),
        events_tx.clone(),
    ));
    let sink = Arc::new(ChannelMediaSink::new(
        start.stream_sid.clone(),
        outbound_tx,
    ));
    let synthesizer = Arc::new(SynthesisClient::new(config.synthesis.clone()));
    let player = Arc::new(SpeechPlayer::new(
        synthesizer,
        sink,
        config.synthesis.clone(),
    ));
    let webhooks = Arc::new(WebhookQueue::default());
    let orchestrator = Arc::new(DialogueOrchestrator::new(
        ChatClient::new(config.llm.clone()),
        config.dialogue.clone(),
        call.clone(),
        state.store.clone(),
        state.store.clone(),
        webhooks.clone(),
        events_tx.clone(),
    ));

    let ctx = SessionContext {
        config,
        call,
        recognition,
        player,
        control: state.control.clone(),
        store: state.store.clone(),
        notifier: state.notifier.clone(),
        orchestrator,
        webhooks,
    };
    CallSession::spawn(ctx, events_tx, events_rx)
}

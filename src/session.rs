//! The call session, one per media stream.
//!
//! Everything that mutates call state flows through one event loop owned
//! by one task: recognition events, dialogue task results, playback marks
//! echoed by the telephony side, and stream closure. Inbound audio is the
//! deliberate exception. It goes straight to the recognition link from
//! [`SessionHandle::audio`] so the recognizer keeps hearing the caller
//! while the loop is busy with a turn, which is what makes barge-in
//! detectable mid-playback.
//!
//! Cleanup runs exactly once per session no matter how the call ends:
//! caller hangup, agent hangup, transfer, turn limit, or a lost
//! recognition link.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::barge_in::{BargeInController, SpeechActivity};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::messages::{AfterSpeech, DialogueEvent, RecognitionEvent, SessionEvent};
use crate::orchestrator::DialogueOrchestrator;
use crate::persistence::{CallOutcome, CallRecord, CallStore, LeadRecord, TranscriptRecord};
use crate::player::SpeechPlayer;
use crate::recognition::RecognitionLink;
use crate::state::{CallState, StateMachine};
use crate::telephony::{CallInfo, TelephonyControl};
use crate::tools::ToolKind;
use crate::utterance::UtteranceAssembler;
use crate::webhook::{self, Notifier, WebhookQueue};

/// Everything a session needs from the outside world.
pub struct SessionContext {
    pub config: Arc<AgentConfig>,
    pub call: CallInfo,
    pub recognition: Arc<dyn RecognitionLink>,
    pub player: Arc<SpeechPlayer>,
    pub control: Arc<dyn TelephonyControl>,
    pub store: Arc<dyn CallStore>,
    pub notifier: Arc<dyn Notifier>,
    pub orchestrator: Arc<DialogueOrchestrator>,
    pub webhooks: Arc<WebhookQueue>,
}

/// The two public entry points into a running session.
#[derive(Clone)]
pub struct SessionHandle {
    recognition: Arc<dyn RecognitionLink>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    /// Forward one inbound telephony audio frame to the recognizer.
    pub async fn audio(&self, frame: Bytes) -> Result<()> {
        self.recognition.send_audio(frame).await
    }

    /// Deliver a control event to the session loop.
    pub fn event(&self, event: SessionEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| AgentError::Session("session loop is gone".to_owned()))
    }
}

/// An utterance currently playing out, identified by its mark.
struct ActivePlayback {
    mark: String,
    cancel: CancellationToken,
    after: AfterSpeech,
}

pub struct CallSession {
    ctx: SessionContext,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    state: StateMachine,
    assembler: UtteranceAssembler,
    barge_in: BargeInController,
    playback: Option<ActivePlayback>,
    /// Completed utterances held while a turn is already in flight.
    pending: VecDeque<String>,
    turn_in_flight: bool,
    turn_count: u32,
    started_at: DateTime<Utc>,
    transferred: bool,
    outcome: CallOutcome,
    cleaned_up: bool,
}

impl CallSession {
    /// Start the session loop. The handle feeds it; the join handle
    /// resolves once cleanup has finished.
    pub fn spawn(
        ctx: SessionContext,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let handle = SessionHandle {
            recognition: ctx.recognition.clone(),
            events: events_tx.clone(),
        };
        let session = Self::new(ctx, events_tx);
        let join = tokio::spawn(session.run(events_rx));
        (handle, join)
    }

    fn new(ctx: SessionContext, events_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            assembler: UtteranceAssembler::new(ctx.config.recognition.min_fragment_chars),
            barge_in: BargeInController::new(ctx.config.barge_in.clone()),
            ctx,
            events_tx,
            state: StateMachine::new(),
            playback: None,
            pending: VecDeque::new(),
            turn_in_flight: false,
            turn_count: 0,
            started_at: Utc::now(),
            transferred: false,
            outcome: CallOutcome::Completed,
            cleaned_up: false,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        tracing::info!(
            call_id = %self.ctx.call.call_id,
            caller = %self.ctx.call.caller,
            "call session started"
        );
        self.begin();
        while self.state.current() != CallState::Ended {
            let Some(event) = events.recv().await else {
                break;
            };
            self.handle_event(event).await;
        }
        self.cleanup().await;
    }

    fn begin(&mut self) {
        self.transition(CallState::Greeting);
        let greeting = self.ctx.config.dialogue.greeting_line.clone();
        self.speak(greeting, AfterSpeech::Resume);
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Recognition(event) => self.on_recognition(event),
            SessionEvent::Dialogue(event) => self.on_dialogue(event).await,
            SessionEvent::MarkReceived { name } => self.on_mark(&name).await,
            SessionEvent::SpeakFailed { mark } => self.on_speak_failed(&mark).await,
            SessionEvent::MediaClosed => {
                tracing::info!("media stream closed");
                self.cleanup().await;
            }
        }
    }

    // ── Recognition ─────────────────────────────────────────────────────

    fn on_recognition(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Transcript {
                text,
                is_final,
                speech_final,
                confidence,
            } => {
                let activity = SpeechActivity::Interim {
                    text: &text,
                    confidence,
                };
                if self.barge_in.should_interrupt(self.state.current(), activity) {
                    self.interrupt_playback();
                }
                if let Some(utterance) = self.assembler.push_fragment(&text, is_final, speech_final)
                {
                    self.accept_utterance(utterance);
                }
            }
            RecognitionEvent::SpeechStarted => {
                if self
                    .barge_in
                    .should_interrupt(self.state.current(), SpeechActivity::Started)
                {
                    self.interrupt_playback();
                }
            }
            RecognitionEvent::UtteranceEnd => {
                if let Some(utterance) = self.assembler.utterance_end() {
                    self.accept_utterance(utterance);
                }
            }
            RecognitionEvent::Closed => {
                tracing::warn!("recognition link lost, winding the call down");
                self.outcome = CallOutcome::Failed;
                self.force_ending();
                let apology = self.ctx.config.dialogue.apology_line.clone();
                self.speak(apology, AfterSpeech::HangUp);
            }
        }
    }

    fn accept_utterance(&mut self, text: String) {
        match self.state.current() {
            CallState::Listening if !self.turn_in_flight => self.dispatch_turn(text),
            CallState::Greeting
            | CallState::Listening
            | CallState::Processing
            | CallState::Speaking
            | CallState::BookingAppointment
            | CallState::LookingUpCustomer => self.queue_utterance(text),
            CallState::Idle
            | CallState::Transferring
            | CallState::Voicemail
            | CallState::Ending
            | CallState::Ended => {
                tracing::debug!(state = ?self.state.current(), "utterance ignored");
            }
        }
    }

    fn dispatch_turn(&mut self, text: String) {
        self.turn_count += 1;
        if self.turn_count > self.ctx.config.dialogue.max_turns {
            tracing::info!(turns = self.turn_count, "turn limit reached, closing the call");
            self.outcome = CallOutcome::TurnLimit;
            self.force_ending();
            let closing = self.ctx.config.dialogue.closing_line.clone();
            self.speak(closing, AfterSpeech::HangUp);
            return;
        }

        tracing::debug!(turn = self.turn_count, "caller said: {text}");
        self.transition(CallState::Processing);
        self.turn_in_flight = true;
        let orchestrator = self.ctx.orchestrator.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = orchestrator.run_turn(text).await;
            let _ = events.send(SessionEvent::Dialogue(DialogueEvent::TurnReady(outcome)));
        });
    }

    fn queue_utterance(&mut self, text: String) {
        self.pending.push_back(text);
        let limit = self.ctx.config.dialogue.pending_utterance_limit.max(1);
        if self.pending.len() > limit
            && let Some(dropped) = self.pending.pop_front()
        {
            tracing::warn!(chars = dropped.len(), "utterance queue full, dropping the oldest");
        }
    }

    fn drain_pending(&mut self) {
        if self.state.current() == CallState::Listening
            && !self.turn_in_flight
            && let Some(text) = self.pending.pop_front()
        {
            self.dispatch_turn(text);
        }
    }

    // ── Dialogue ────────────────────────────────────────────────────────

    async fn on_dialogue(&mut self, event: DialogueEvent) {
        match event {
            DialogueEvent::ActionStarted(kind) => {
                let target = match kind {
                    ToolKind::BookAppointment => Some(CallState::BookingAppointment),
                    ToolKind::LookupCustomer => Some(CallState::LookingUpCustomer),
                    ToolKind::TransferToHuman => Some(CallState::Transferring),
                    _ => None,
                };
                if let Some(target) = target {
                    self.transition(target);
                }
            }
            DialogueEvent::ActionFinished(kind) => {
                let expected = match kind {
                    ToolKind::BookAppointment => Some(CallState::BookingAppointment),
                    ToolKind::LookupCustomer => Some(CallState::LookingUpCustomer),
                    _ => None,
                };
                if expected == Some(self.state.current()) {
                    self.transition(CallState::Processing);
                }
            }
            DialogueEvent::TurnReady(outcome) => {
                self.turn_in_flight = false;
                match outcome.say {
                    Some(text) => self.speak(text, outcome.after),
                    None => self.apply_after(outcome.after).await,
                }
            }
        }
    }

    // ── Playback ────────────────────────────────────────────────────────

    /// Start playing `text`, remembering what to do once its mark comes
    /// back. While transferring or ending the state stays put; otherwise a
    /// turn's reply moves `processing` to `speaking`.
    fn speak(&mut self, text: String, after: AfterSpeech) {
        if self.state.current() == CallState::Processing {
            self.transition(CallState::Speaking);
        }
        self.ctx.orchestrator.record_agent_line(&text);

        let mark = format!("utt-{}", uuid::Uuid::new_v4());
        let cancel = CancellationToken::new();
        self.barge_in.arm();
        self.playback = Some(ActivePlayback {
            mark: mark.clone(),
            cancel: cancel.clone(),
            after,
        });

        let player = self.ctx.player.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = player.play(&text, &mark, &cancel).await {
                tracing::warn!("playback failed: {e}");
                let _ = events.send(SessionEvent::SpeakFailed { mark });
            }
        });
    }

    /// Barge-in: drop the in-flight playback and its mark, then listen.
    /// Safe to hit repeatedly; only the first call finds a playback.
    fn interrupt_playback(&mut self) {
        let Some(playback) = self.playback.take() else {
            return;
        };
        tracing::info!("caller barge-in, cancelling playback");
        playback.cancel.cancel();
        self.transition(CallState::Listening);
        self.drain_pending();
    }

    async fn on_mark(&mut self, name: &str) {
        let matches = self
            .playback
            .as_ref()
            .is_some_and(|playback| playback.mark == name);
        if !matches {
            tracing::debug!(mark = %name, "stale playback mark ignored");
            return;
        }
        let after = self.playback.take().map(|playback| playback.after);
        if let Some(after) = after {
            self.apply_after(after).await;
        }
    }

    async fn on_speak_failed(&mut self, mark: &str) {
        let matches = self
            .playback
            .as_ref()
            .is_some_and(|playback| playback.mark == mark);
        if !matches {
            return;
        }
        tracing::warn!("utterance was not spoken, continuing without it");
        let after = self.playback.take().map(|playback| playback.after);
        if let Some(after) = after {
            self.apply_after(after).await;
        }
    }

    async fn apply_after(&mut self, after: AfterSpeech) {
        match after {
            AfterSpeech::Resume => {
                self.transition(CallState::Listening);
                self.drain_pending();
            }
            AfterSpeech::Transfer => self.redirect_and_close().await,
            AfterSpeech::HangUp => self.cleanup().await,
        }
    }

    async fn redirect_and_close(&mut self) {
        if !self.transferred {
            self.transferred = true;
            self.outcome = CallOutcome::Transferred;
            let target = self.ctx.config.dialogue.transfer_target.clone();
            if target.is_empty() {
                tracing::warn!("no transfer target configured, ending the call instead");
            } else if let Err(e) = self
                .ctx
                .control
                .redirect(&self.ctx.call.call_id, &target)
                .await
            {
                tracing::warn!("redirect failed: {e}");
            }
        }
        self.cleanup().await;
    }

    // ── Teardown ────────────────────────────────────────────────────────

    async fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        self.force_ending();
        self.ctx.recognition.close();
        if let Some(playback) = self.playback.take() {
            playback.cancel.cancel();
        }

        webhook::flush(&self.ctx.webhooks, self.ctx.notifier.as_ref()).await;

        let history = self.ctx.orchestrator.history_snapshot();
        let profile = self.ctx.orchestrator.profile_snapshot();
        let ended_at = Utc::now();

        let record = CallRecord {
            call_id: self.ctx.call.call_id.clone(),
            stream_id: self.ctx.call.stream_id.clone(),
            tenant: self.ctx.call.tenant.clone(),
            caller: self.ctx.call.caller.clone(),
            callee: self.ctx.call.callee.clone(),
            started_at: self.started_at,
            ended_at,
            turns: self.turn_count,
            outcome: self.outcome,
            transferred: self.transferred,
        };
        if let Err(e) = self.ctx.store.save_call(&record).await {
            tracing::warn!("call record not saved: {e}");
        }

        let transcript = TranscriptRecord {
            call_id: self.ctx.call.call_id.clone(),
            tenant: self.ctx.call.tenant.clone(),
            transcript: history.transcript_text(),
            summary: history.summary(&profile, &self.outcome.to_string()),
            created_at: ended_at,
        };
        if let Err(e) = self.ctx.store.save_transcript(&transcript).await {
            tracing::warn!("transcript not saved: {e}");
        }

        if let Some(lead) =
            LeadRecord::from_profile(&self.ctx.call.tenant, &self.ctx.call.caller, &profile)
        {
            if let Err(e) = self.ctx.store.upsert_lead(lead).await {
                tracing::warn!("lead not saved: {e}");
            }
        }

        self.transition(CallState::Ended);
        tracing::info!(
            call_id = %self.ctx.call.call_id,
            turns = self.turn_count,
            outcome = %self.outcome,
            "call session closed"
        );
    }

    // ── State helpers ───────────────────────────────────────────────────

    fn transition(&mut self, to: CallState) {
        match self.state.transition(to) {
            Ok(Some(change)) => {
                tracing::debug!(from = ?change.from, to = ?change.to, "call state change");
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("rejected state change: {e}"),
        }
    }

    fn force_ending(&mut self) {
        if let Some(change) = self.state.force_ending() {
            tracing::debug!(from = ?change.from, "call state forced to ending");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::DialogueConfig;
    use crate::error::Result;
    use crate::llm::ChatClient;
    use crate::persistence::{
        Appointment, AppointmentRequest, Calendar, CustomerDirectory, CustomerRecord,
    };
    use crate::synthesis::{SpeechStream, SpeechSynthesizer};
    use crate::telephony::MediaSink;
    use crate::webhook::WebhookJob;
    use async_trait::async_trait;

    struct NullLink;

    #[async_trait]
    impl RecognitionLink for NullLink {
        async fn send_audio(&self, _frame: Bytes) -> Result<()> {
            Ok(())
        }
        fn close(&self) {}
    }

    struct NullSink;

    #[async_trait]
    impl MediaSink for NullSink {
        async fn send_audio(&self, _payload_b64: &str) -> Result<()> {
            Ok(())
        }
        async fn send_mark(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn clear(&self) -> Result<()> {
            Ok(())
        }
    }

    struct StubSynthesizer;

    #[async_trait]
    impl SpeechSynthesizer for StubSynthesizer {
        async fn stream_speech(&self, _text: &str) -> Result<SpeechStream> {
            Err(AgentError::Synthesis("stub".to_owned()))
        }
    }

    struct NullControl;

    #[async_trait]
    impl TelephonyControl for NullControl {
        async fn redirect(&self, _call_id: &str, _target: &str) -> Result<()> {
            Ok(())
        }
    }

    struct NullStore;

    #[async_trait]
    impl CallStore for NullStore {
        async fn save_call(&self, _record: &CallRecord) -> Result<()> {
            Ok(())
        }
        async fn save_transcript(&self, _record: &TranscriptRecord) -> Result<()> {
            Ok(())
        }
        async fn upsert_lead(&self, _record: LeadRecord) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Calendar for NullStore {
        async fn book(&self, _request: &AppointmentRequest) -> Result<Appointment> {
            Err(AgentError::Store("no calendar in tests".to_owned()))
        }
    }

    #[async_trait]
    impl CustomerDirectory for NullStore {
        async fn find(
            &self,
            _tenant: &str,
            _email: Option<&str>,
            _phone: Option<&str>,
        ) -> Result<Option<CustomerRecord>> {
            Ok(None)
        }
    }

    struct NullNotifier;

    #[async_trait]
    impl Notifier for NullNotifier {
        async fn deliver(&self, _job: &WebhookJob) -> Result<()> {
            Ok(())
        }
    }

    fn build_session(
        mut config: AgentConfig,
    ) -> (CallSession, mpsc::UnboundedReceiver<SessionEvent>) {
        // Point the model at a closed local port so stray turns fail fast
        // instead of leaving the test network-bound.
        config.llm.base_url = "http://127.0.0.1:9".to_owned();
        config.llm.timeout_s = 1;
        let config = Arc::new(config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let call = CallInfo {
            call_id: "CA01".to_owned(),
            stream_id: "MZ02".to_owned(),
            caller: "+15550100".to_owned(),
            callee: "+15550199".to_owned(),
            tenant: "AC00".to_owned(),
        };
        let webhooks = Arc::new(WebhookQueue::default());
        let orchestrator = Arc::new(DialogueOrchestrator::new(
            ChatClient::new(config.llm.clone()),
            config.dialogue.clone(),
            call.clone(),
            Arc::new(NullStore),
            Arc::new(NullStore),
            webhooks.clone(),
            events_tx.clone(),
        ));
        let player = Arc::new(SpeechPlayer::new(
            Arc::new(StubSynthesizer),
            Arc::new(NullSink),
            config.synthesis.clone(),
        ));
        let ctx = SessionContext {
            config,
            call,
            recognition: Arc::new(NullLink),
            player,
            control: Arc::new(NullControl),
            store: Arc::new(NullStore),
            notifier: Arc::new(NullNotifier),
            orchestrator,
            webhooks,
        };
        (CallSession::new(ctx, events_tx), events_rx)
    }

    fn to_listening(session: &mut CallSession) {
        session.transition(CallState::Greeting);
        session.transition(CallState::Listening);
    }

    #[tokio::test]
    async fn greeting_starts_playback_and_lands_in_history() {
        let (mut session, _events) = build_session(AgentConfig::default());
        session.begin();

        assert_eq!(session.state.current(), CallState::Greeting);
        assert!(session.playback.is_some());
        let history = session.ctx.orchestrator.history_snapshot();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn utterances_queue_during_a_turn_and_drop_oldest_beyond_the_limit() {
        let config = AgentConfig {
            dialogue: DialogueConfig {
                pending_utterance_limit: 3,
                ..DialogueConfig::default()
            },
            ..AgentConfig::default()
        };
        let (mut session, _events) = build_session(config);
        to_listening(&mut session);
        session.turn_in_flight = true;

        for i in 1..=5 {
            session.accept_utterance(format!("utterance {i}"));
        }

        assert_eq!(session.pending.len(), 3);
        assert_eq!(session.pending.front().map(String::as_str), Some("utterance 3"));
        assert_eq!(session.turn_count, 0);
    }

    #[tokio::test]
    async fn utterances_are_ignored_once_transfer_starts() {
        let (mut session, _events) = build_session(AgentConfig::default());
        to_listening(&mut session);
        session.transition(CallState::Processing);
        session.transition(CallState::Transferring);

        session.accept_utterance("wait I have one more question".to_owned());

        assert!(session.pending.is_empty());
        assert_eq!(session.turn_count, 0);
    }

    #[tokio::test]
    async fn barge_in_cancels_playback_and_ignores_the_stale_mark() {
        let (mut session, _events) = build_session(AgentConfig::default());
        to_listening(&mut session);
        session.transition(CallState::Processing);
        session.transition(CallState::Speaking);
        let cancel = CancellationToken::new();
        session.playback = Some(ActivePlayback {
            mark: "utt-old".to_owned(),
            cancel: cancel.clone(),
            after: AfterSpeech::Resume,
        });

        session.on_recognition(RecognitionEvent::SpeechStarted);

        assert!(cancel.is_cancelled());
        assert!(session.playback.is_none());
        assert_eq!(session.state.current(), CallState::Listening);

        // The invalidated mark arrives late and must change nothing.
        session.on_mark("utt-old").await;
        assert_eq!(session.state.current(), CallState::Listening);
        assert!(!session.cleaned_up);
    }

    #[tokio::test]
    async fn completion_mark_resumes_listening_only_for_the_live_mark() {
        let (mut session, _events) = build_session(AgentConfig::default());
        to_listening(&mut session);
        session.transition(CallState::Processing);
        session.transition(CallState::Speaking);
        session.playback = Some(ActivePlayback {
            mark: "utt-live".to_owned(),
            cancel: CancellationToken::new(),
            after: AfterSpeech::Resume,
        });

        session.on_mark("utt-other").await;
        assert!(session.playback.is_some());
        assert_eq!(session.state.current(), CallState::Speaking);

        session.on_mark("utt-live").await;
        assert!(session.playback.is_none());
        assert_eq!(session.state.current(), CallState::Listening);
    }

    #[tokio::test]
    async fn turn_limit_short_circuits_with_the_closing_line() {
        let config = AgentConfig {
            dialogue: DialogueConfig {
                max_turns: 3,
                ..DialogueConfig::default()
            },
            ..AgentConfig::default()
        };
        let (mut session, _events) = build_session(config);
        to_listening(&mut session);

        for i in 1..=3 {
            session.dispatch_turn(format!("turn {i}"));
            session.turn_in_flight = false;
            session.transition(CallState::Listening);
        }
        assert_eq!(session.turn_count, 3);
        assert_eq!(session.outcome, CallOutcome::Completed);

        session.dispatch_turn("one too many".to_owned());

        assert_eq!(session.turn_count, 4);
        assert_eq!(session.outcome, CallOutcome::TurnLimit);
        assert_eq!(session.state.current(), CallState::Ending);
        // The closing line is in flight, not a dialogue turn.
        assert!(session.playback.is_some());
        assert!(!session.turn_in_flight);
    }

    #[tokio::test]
    async fn cleanup_runs_once_and_ends_the_session() {
        let (mut session, _events) = build_session(AgentConfig::default());
        to_listening(&mut session);

        session.cleanup().await;
        assert_eq!(session.state.current(), CallState::Ended);
        assert!(session.cleaned_up);

        // A second trigger is a no-op.
        session.cleanup().await;
        assert_eq!(session.state.current(), CallState::Ended);
    }
}

//! Dialogue turn driving.
//!
//! One [`run_turn`](DialogueOrchestrator::run_turn) per finalized caller
//! utterance: absorb text heuristics into the profile, ask the model for a
//! reply with the tool catalogue offered, execute any tool calls in the
//! order returned, then ask once more, tool-free, for the line to speak.
//! Every failure path degrades to a fixed line so the caller never gets
//! silence.

use chrono::Utc;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::config::DialogueConfig;
use crate::history::ConversationHistory;
use crate::llm::{ChatClient, ToolCall};
use crate::messages::{AfterSpeech, DialogueEvent, SessionEvent, TurnOutcome};
use crate::persistence::{AppointmentRequest, Calendar, CustomerDirectory};
use crate::profile::{CallerProfile, CustomerRef, Urgency};
use crate::sentiment;
use crate::telephony::CallInfo;
use crate::tools::{
    BookAppointmentArgs, CollectInfoArgs, EndCallArgs, LookupCustomerArgs, SendWebhookArgs,
    ToolKind, TransferArgs,
};
use crate::webhook::{WebhookJob, WebhookQueue};

pub struct DialogueOrchestrator {
    llm: ChatClient,
    config: DialogueConfig,
    call: CallInfo,
    history: Mutex<ConversationHistory>,
    profile: Mutex<CallerProfile>,
    calendar: Arc<dyn Calendar>,
    directory: Arc<dyn CustomerDirectory>,
    webhooks: Arc<WebhookQueue>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl DialogueOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: ChatClient,
        config: DialogueConfig,
        call: CallInfo,
        calendar: Arc<dyn Calendar>,
        directory: Arc<dyn CustomerDirectory>,
        webhooks: Arc<WebhookQueue>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            llm,
            config,
            call,
            history: Mutex::new(ConversationHistory::new()),
            profile: Mutex::new(CallerProfile::default()),
            calendar,
            directory,
            webhooks,
            events,
        }
    }

    /// Record a line the agent is about to speak. The session calls this
    /// for every playback it starts, so the transcript stays complete.
    pub fn record_agent_line(&self, text: &str) {
        self.lock_history().push_agent(text.to_owned());
    }

    pub fn history_snapshot(&self) -> ConversationHistory {
        self.lock_history().clone()
    }

    pub fn profile_snapshot(&self) -> CallerProfile {
        self.lock_profile().clone()
    }

    /// Drive one full dialogue turn for a finalized caller utterance.
    pub async fn run_turn(&self, utterance: String) -> TurnOutcome {
        self.absorb_signals(&utterance);
        self.lock_history().push_caller(utterance);

        let snapshot = self.history_snapshot();
        let reply = match self.llm.respond(&snapshot, true).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("model request failed: {e}");
                return self.apology();
            }
        };

        if reply.tool_calls.is_empty() {
            return match reply.text {
                Some(text) => TurnOutcome {
                    say: Some(text),
                    after: AfterSpeech::Resume,
                },
                None => {
                    tracing::warn!("model returned neither text nor tool calls");
                    self.apology()
                }
            };
        }

        tracing::info!(
            tools = ?reply.tool_calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "model requested tool calls"
        );

        let mut after = AfterSpeech::Resume;
        for call in &reply.tool_calls {
            let (result, effect) = self.execute_tool(call).await;
            if let Some(effect) = effect {
                // Transfer outranks hangup when the model asks for both.
                if after != AfterSpeech::Transfer {
                    after = effect;
                }
            }
            let arguments = serde_json::from_str(&call.arguments)
                .unwrap_or_else(|_| Value::String(call.arguments.clone()));
            self.lock_history()
                .push_tool(call.id.as_str(), call.name.as_str(), arguments, result);
        }

        let snapshot = self.history_snapshot();
        let say = match self.llm.respond(&snapshot, false).await {
            Ok(follow_up) => follow_up.text,
            Err(e) => {
                tracing::warn!("follow-up request failed: {e}");
                None
            }
        };
        let say = say.unwrap_or_else(|| self.fallback_line(after));
        TurnOutcome {
            say: Some(say),
            after,
        }
    }

    /// Keyword heuristics applied before the model sees the utterance.
    fn absorb_signals(&self, utterance: &str) {
        let signals = sentiment::analyze(utterance);
        let mut profile = self.lock_profile();
        if signals.positive_hits + signals.negative_hits > 0 {
            profile.sentiment = signals.sentiment;
        }
        if signals.is_critical() {
            profile.escalate_urgency(Urgency::Critical);
        }
    }

    async fn execute_tool(&self, call: &ToolCall) -> (Value, Option<AfterSpeech>) {
        let Some(kind) = ToolKind::from_name(&call.name) else {
            tracing::warn!(tool = %call.name, "model invoked an unknown tool");
            return (
                json!({"error": format!("unknown tool '{}'", call.name)}),
                None,
            );
        };
        match kind {
            ToolKind::CollectInfo => match parse_args::<CollectInfoArgs>(&call.arguments) {
                Ok(args) => (self.collect_info(args), None),
                Err(e) => (self.invalid_args(kind, &e), None),
            },
            ToolKind::LookupCustomer => match parse_args::<LookupCustomerArgs>(&call.arguments) {
                Ok(args) => (self.lookup_customer(args).await, None),
                Err(e) => (self.invalid_args(kind, &e), None),
            },
            ToolKind::BookAppointment => match parse_args::<BookAppointmentArgs>(&call.arguments)
            {
                Ok(args) => (self.book_appointment(args).await, None),
                Err(e) => (self.invalid_args(kind, &e), None),
            },
            ToolKind::TransferToHuman => match parse_args::<TransferArgs>(&call.arguments) {
                Ok(args) => (self.transfer_to_human(args), Some(AfterSpeech::Transfer)),
                Err(e) => (self.invalid_args(kind, &e), None),
            },
            ToolKind::EndCall => match parse_args::<EndCallArgs>(&call.arguments) {
                Ok(args) => (self.end_call(args), Some(AfterSpeech::HangUp)),
                Err(e) => (self.invalid_args(kind, &e), None),
            },
            ToolKind::SendWebhook => match parse_args::<SendWebhookArgs>(&call.arguments) {
                Ok(args) => (self.send_webhook(args), None),
                Err(e) => (self.invalid_args(kind, &e), None),
            },
        }
    }

    fn collect_info(&self, args: CollectInfoArgs) -> Value {
        let urgency = args.urgency_level();
        let mut profile = self.lock_profile();
        CallerProfile::set_if_present(&mut profile.name, args.name);
        CallerProfile::set_if_present(&mut profile.email, args.email);
        CallerProfile::set_if_present(&mut profile.company, args.company);
        CallerProfile::set_if_present(&mut profile.reason, args.reason);
        CallerProfile::set_if_present(&mut profile.service_interest, args.service_interest);
        CallerProfile::set_if_present(&mut profile.callback_time, args.callback_time);
        if let Some(level) = urgency {
            profile.escalate_urgency(level);
        }
        json!({"status": "saved"})
    }

    async fn lookup_customer(&self, args: LookupCustomerArgs) -> Value {
        self.notify(DialogueEvent::ActionStarted(ToolKind::LookupCustomer));
        let email = args.email.as_deref().map(str::trim).filter(|s| !s.is_empty());
        // Fall back to the caller's own address when the model gave nothing
        // to search by.
        let phone = args
            .phone
            .clone()
            .filter(|p| !p.trim().is_empty())
            .or_else(|| Some(self.call.caller.clone()).filter(|c| !c.is_empty()));

        let value = match self
            .directory
            .find(&self.call.tenant, email, phone.as_deref())
            .await
        {
            Ok(Some(customer)) => {
                let mut profile = self.lock_profile();
                CallerProfile::set_if_present(&mut profile.name, customer.name.clone());
                profile.matched_customer = Some(CustomerRef {
                    id: customer.id.clone(),
                    name: customer.name.clone().unwrap_or_default(),
                });
                json!({"found": true, "name": customer.name, "email": customer.email})
            }
            Ok(None) => json!({"found": false}),
            Err(e) => {
                tracing::warn!("customer lookup failed: {e}");
                json!({"found": false, "error": e.to_string()})
            }
        };
        self.notify(DialogueEvent::ActionFinished(ToolKind::LookupCustomer));
        value
    }

    async fn book_appointment(&self, args: BookAppointmentArgs) -> Value {
        self.notify(DialogueEvent::ActionStarted(ToolKind::BookAppointment));
        let name = {
            let mut profile = self.lock_profile();
            profile.appointment_time = Some(format!("{} {}", args.date, args.time));
            CallerProfile::set_if_present(&mut profile.name, args.name.clone());
            profile.name.clone()
        };
        let request = AppointmentRequest {
            tenant: self.call.tenant.clone(),
            caller: self.call.caller.clone(),
            date: args.date.clone(),
            time: args.time.clone(),
            name,
            service: args.service.clone(),
        };

        let value = match self.calendar.book(&request).await {
            Ok(appointment) => json!({
                "status": "booked",
                "confirmation": appointment.id,
                "date": appointment.date,
                "time": appointment.time,
            }),
            Err(e) => {
                tracing::warn!("booking failed, queuing manual follow-up: {e}");
                self.webhooks.push(WebhookJob {
                    event: "appointment.follow_up_needed".to_owned(),
                    call_id: self.call.call_id.clone(),
                    tenant: self.call.tenant.clone(),
                    payload: json!({
                        "date": request.date,
                        "time": request.time,
                        "name": request.name,
                        "service": request.service,
                        "caller": request.caller,
                    }),
                    queued_at: Utc::now(),
                });
                json!({
                    "status": "pending",
                    "note": "booking could not be confirmed automatically; a team member will call back to confirm",
                })
            }
        };
        self.notify(DialogueEvent::ActionFinished(ToolKind::BookAppointment));
        value
    }

    fn transfer_to_human(&self, args: TransferArgs) -> Value {
        {
            let mut profile = self.lock_profile();
            profile.wants_human_agent = true;
            CallerProfile::set_if_present(&mut profile.reason, args.reason);
        }
        self.notify(DialogueEvent::ActionStarted(ToolKind::TransferToHuman));
        json!({"status": "transferring", "note": "say a short handoff line; the caller is redirected after it plays"})
    }

    fn end_call(&self, args: EndCallArgs) -> Value {
        if let Some(reason) = args.reason {
            tracing::info!(%reason, "model ended the call");
        }
        json!({"status": "ending", "note": "say a short goodbye; the call closes after it plays"})
    }

    fn send_webhook(&self, args: SendWebhookArgs) -> Value {
        self.webhooks.push(WebhookJob {
            event: args.event,
            call_id: self.call.call_id.clone(),
            tenant: self.call.tenant.clone(),
            payload: args.payload.unwrap_or(Value::Null),
            queued_at: Utc::now(),
        });
        json!({"status": "queued"})
    }

    fn invalid_args(&self, kind: ToolKind, error: &str) -> Value {
        tracing::warn!(tool = %kind.name(), "unparseable tool arguments: {error}");
        json!({"error": format!("invalid arguments: {error}")})
    }

    fn apology(&self) -> TurnOutcome {
        TurnOutcome {
            say: Some(self.config.apology_line.clone()),
            after: AfterSpeech::Resume,
        }
    }

    fn fallback_line(&self, after: AfterSpeech) -> String {
        match after {
            AfterSpeech::Transfer => self.config.transfer_line.clone(),
            AfterSpeech::HangUp => self.config.closing_line.clone(),
            AfterSpeech::Resume => self.config.apology_line.clone(),
        }
    }

    fn notify(&self, event: DialogueEvent) {
        let _ = self.events.send(SessionEvent::Dialogue(event));
    }

    fn lock_history(&self) -> MutexGuard<'_, ConversationHistory> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_profile(&self) -> MutexGuard<'_, CallerProfile> {
        self.profile.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parse tool-call arguments, treating a blank string as an empty object.
fn parse_args<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, String> {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).map_err(|e| e.to_string())
}

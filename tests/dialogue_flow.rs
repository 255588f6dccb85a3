//! Full dialogue turns against a mock OpenAI-compatible server.
//!
//! The in-module orchestrator tests cover individual tool handlers; these
//! drive `run_turn` end to end, tool loop and follow-up request included,
//! and inspect the wire shape of what goes back to the model.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lark::config::{DialogueConfig, LlmConfig};
use lark::error::AgentError;
use lark::llm::ChatClient;
use lark::messages::{AfterSpeech, SessionEvent};
use lark::orchestrator::DialogueOrchestrator;
use lark::persistence::{
    Appointment, AppointmentRequest, Calendar, CustomerDirectory, CustomerRecord,
};
use lark::telephony::CallInfo;
use lark::webhook::WebhookQueue;

// ────────────────────────────────────────────────────────────────────────────
// Collaborator stubs
// ────────────────────────────────────────────────────────────────────────────

struct OkCalendar;

#[async_trait]
impl Calendar for OkCalendar {
    async fn book(&self, request: &AppointmentRequest) -> lark::Result<Appointment> {
        Ok(Appointment {
            id: "apt-22".to_owned(),
            date: request.date.clone(),
            time: request.time.clone(),
        })
    }
}

struct FailingCalendar;

#[async_trait]
impl Calendar for FailingCalendar {
    async fn book(&self, _request: &AppointmentRequest) -> lark::Result<Appointment> {
        Err(AgentError::Store("calendar offline".to_owned()))
    }
}

struct EmptyDirectory;

#[async_trait]
impl CustomerDirectory for EmptyDirectory {
    async fn find(
        &self,
        _tenant: &str,
        _email: Option<&str>,
        _phone: Option<&str>,
    ) -> lark::Result<Option<CustomerRecord>> {
        Ok(None)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Builders
// ────────────────────────────────────────────────────────────────────────────

struct Fixture {
    orchestrator: DialogueOrchestrator,
    webhooks: Arc<WebhookQueue>,
    _events: mpsc::UnboundedReceiver<SessionEvent>,
}

fn fixture_with(server: &MockServer, calendar: Arc<dyn Calendar>) -> Fixture {
    let (tx, rx) = mpsc::unbounded_channel();
    let webhooks = Arc::new(WebhookQueue::default());
    let llm = ChatClient::new(LlmConfig {
        api_key: "test-key".to_owned(),
        base_url: server.uri(),
        timeout_s: 5,
        ..LlmConfig::default()
    });
    let call = CallInfo {
        call_id: "CA31".to_owned(),
        stream_id: "MZ31".to_owned(),
        caller: "+15550100".to_owned(),
        callee: "+15550199".to_owned(),
        tenant: "AC00".to_owned(),
    };
    let orchestrator = DialogueOrchestrator::new(
        llm,
        DialogueConfig::default(),
        call,
        calendar,
        Arc::new(EmptyDirectory),
        webhooks.clone(),
        tx,
    );
    Fixture {
        orchestrator,
        webhooks,
        _events: rx,
    }
}

fn fixture(server: &MockServer) -> Fixture {
    fixture_with(server, Arc::new(OkCalendar))
}

/// A 200 response whose single choice carries plain text.
fn text_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "chatcmpl-follow",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    }))
}

/// A 200 response whose single choice carries tool calls and no text.
fn tool_reply(tool_calls: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "chatcmpl-tools",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": null, "tool_calls": tool_calls},
            "finish_reason": "tool_calls"
        }]
    }))
}

async fn chat_requests(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.body_json::<Value>().unwrap())
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Turn flow
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn tool_calls_execute_in_order_and_replay_in_the_follow_up() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(tool_reply(json!([
            {
                "id": "call_a",
                "type": "function",
                "function": {"name": "collect_info", "arguments": "{\"name\": \"Dana\"}"}
            },
            {
                "id": "call_b",
                "type": "function",
                "function": {
                    "name": "book_appointment",
                    "arguments": "{\"date\": \"2026-09-03\", \"time\": \"14:00\"}"
                }
            }
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(text_reply("You're booked for Wednesday at two."))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let fixture = fixture(&server);
    let outcome = fixture
        .orchestrator
        .run_turn("I'd like to book a visit, this is Dana".to_owned())
        .await;

    assert_eq!(outcome.say.as_deref(), Some("You're booked for Wednesday at two."));
    assert_eq!(outcome.after, AfterSpeech::Resume);

    let profile = fixture.orchestrator.profile_snapshot();
    assert_eq!(profile.name.as_deref(), Some("Dana"));
    assert_eq!(profile.appointment_time.as_deref(), Some("2026-09-03 14:00"));

    let requests = chat_requests(&server).await;
    assert_eq!(requests.len(), 2);

    // The opening request offers the catalogue; the follow-up must not.
    assert!(requests[0].get("tools").is_some());
    assert!(requests[1].get("tools").is_none());

    // system, user, then an assistant/tool pair per executed call, in order.
    let messages = requests[1]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 6);
    assert_eq!(messages[2]["tool_calls"][0]["id"], "call_a");
    assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], "collect_info");
    assert_eq!(messages[3]["role"], "tool");
    assert_eq!(messages[3]["tool_call_id"], "call_a");
    assert_eq!(messages[4]["tool_calls"][0]["id"], "call_b");
    assert_eq!(
        messages[4]["tool_calls"][0]["function"]["name"],
        "book_appointment"
    );
    assert_eq!(messages[5]["tool_call_id"], "call_b");
    assert!(messages[5]["content"].as_str().unwrap().contains("booked"));

    // Arguments replay as JSON, not as the raw string the model sent.
    let replayed: Value =
        serde_json::from_str(messages[2]["tool_calls"][0]["function"]["arguments"].as_str().unwrap())
            .unwrap();
    assert_eq!(replayed, json!({"name": "Dana"}));
}

#[tokio::test]
async fn model_failure_degrades_to_the_apology_line() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .expect(1)
        .mount(&server)
        .await;

    let fixture = fixture(&server);
    let outcome = fixture
        .orchestrator
        .run_turn("hello?".to_owned())
        .await;

    assert_eq!(
        outcome.say.as_deref(),
        Some(DialogueConfig::default().apology_line.as_str())
    );
    assert_eq!(outcome.after, AfterSpeech::Resume);
}

#[tokio::test]
async fn transfer_outranks_a_hang_up_requested_in_the_same_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(tool_reply(json!([
            {
                "id": "call_t",
                "type": "function",
                "function": {
                    "name": "transfer_to_human",
                    "arguments": "{\"reason\": \"caller asked for a person\"}"
                }
            },
            {
                "id": "call_e",
                "type": "function",
                "function": {"name": "end_call", "arguments": "{}"}
            }
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(text_reply("Of course, connecting you now."))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let fixture = fixture(&server);
    let outcome = fixture
        .orchestrator
        .run_turn("I'd like to speak to a person".to_owned())
        .await;

    assert_eq!(outcome.say.as_deref(), Some("Of course, connecting you now."));
    assert_eq!(outcome.after, AfterSpeech::Transfer);
    assert!(fixture.orchestrator.profile_snapshot().wants_human_agent);
}

#[tokio::test]
async fn end_call_hangs_up_after_the_goodbye() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(tool_reply(json!([{
            "id": "call_e",
            "type": "function",
            "function": {"name": "end_call", "arguments": "{\"reason\": \"caller is done\"}"}
        }])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(text_reply("Thanks for calling, goodbye!"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let fixture = fixture(&server);
    let outcome = fixture
        .orchestrator
        .run_turn("no, that's everything, thanks".to_owned())
        .await;

    assert_eq!(outcome.say.as_deref(), Some("Thanks for calling, goodbye!"));
    assert_eq!(outcome.after, AfterSpeech::HangUp);
}

#[tokio::test]
async fn booking_failure_queues_a_follow_up_webhook_and_still_speaks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(tool_reply(json!([{
            "id": "call_b",
            "type": "function",
            "function": {
                "name": "book_appointment",
                "arguments": "{\"date\": \"2026-09-04\", \"time\": \"09:00\", \"name\": \"Ira\"}"
            }
        }])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(text_reply("We'll call you back to confirm the slot."))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let fixture = fixture_with(&server, Arc::new(FailingCalendar));
    let outcome = fixture
        .orchestrator
        .run_turn("book me for tomorrow at nine".to_owned())
        .await;

    assert_eq!(
        outcome.say.as_deref(),
        Some("We'll call you back to confirm the slot.")
    );
    assert_eq!(outcome.after, AfterSpeech::Resume);

    let jobs = fixture.webhooks.drain();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].event, "appointment.follow_up_needed");
    assert_eq!(jobs[0].call_id, "CA31");
    assert_eq!(jobs[0].payload["date"], "2026-09-04");
    assert_eq!(jobs[0].payload["name"], "Ira");
}

#[tokio::test]
async fn follow_up_failure_falls_back_to_the_line_for_the_effect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(tool_reply(json!([{
            "id": "call_t",
            "type": "function",
            "function": {"name": "transfer_to_human", "arguments": "{}"}
        }])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let fixture = fixture(&server);
    let outcome = fixture
        .orchestrator
        .run_turn("get me a human".to_owned())
        .await;

    // The transfer still happens; the canned transfer line covers the gap.
    assert_eq!(
        outcome.say.as_deref(),
        Some(DialogueConfig::default().transfer_line.as_str())
    );
    assert_eq!(outcome.after, AfterSpeech::Transfer);
}

//! End-to-end turns through the conversation runtime over in-memory
//! repositories, a scripted completion client, and a recording email
//! transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use leadline_agent::runtime::{ConversationRuntime, RuntimeOptions};
use leadline_agent::{RecordingEmailTransport, ScriptedCompletionClient, ToolRegistry};
use leadline_core::domain::history::ChatTurn;
use leadline_core::domain::memory::EntityAction;
use leadline_core::domain::session::{SessionId, SessionRecord};
use leadline_db::repositories::{
    ChatHistoryRepository, ConversationMemoryRepository, CrmRepository, CrmTable,
    InMemoryAuditLogRepository, InMemoryChatHistoryRepository, InMemoryConversationMemoryRepository,
    InMemoryCrmRepository, RepositoryError,
};

/// Counts history reads so the skip heuristic is observable.
struct CountingHistoryRepository {
    inner: InMemoryChatHistoryRepository,
    reads: AtomicUsize,
}

impl CountingHistoryRepository {
    fn new() -> Self {
        Self { inner: InMemoryChatHistoryRepository::default(), reads: AtomicUsize::new(0) }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChatHistoryRepository for CountingHistoryRepository {
    async fn recent_turns(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<ChatTurn>, RepositoryError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.recent_turns(session_id, limit).await
    }

    async fn save_turn(&self, turn: ChatTurn) -> Result<(), RepositoryError> {
        self.inner.save_turn(turn).await
    }

    async fn count_turns(&self, session_id: &SessionId) -> Result<i64, RepositoryError> {
        self.inner.count_turns(session_id).await
    }
}

struct Harness {
    runtime: ConversationRuntime,
    history: Arc<CountingHistoryRepository>,
    memory: Arc<InMemoryConversationMemoryRepository>,
    crm: Arc<InMemoryCrmRepository>,
    completion: Arc<ScriptedCompletionClient>,
    email: Arc<RecordingEmailTransport>,
    session: SessionRecord,
}

impl Harness {
    fn new() -> Self {
        let history = Arc::new(CountingHistoryRepository::new());
        let memory = Arc::new(InMemoryConversationMemoryRepository::default());
        let crm = Arc::new(InMemoryCrmRepository::default());
        let audit = Arc::new(InMemoryAuditLogRepository::default());
        let completion = Arc::new(ScriptedCompletionClient::default());
        let email = Arc::new(RecordingEmailTransport::default());

        let runtime = ConversationRuntime::new(
            Arc::clone(&history) as _,
            Arc::clone(&memory) as _,
            Arc::clone(&crm) as _,
            audit as _,
            Arc::clone(&completion) as _,
            Arc::clone(&email) as _,
            ToolRegistry::standard(),
            RuntimeOptions::default(),
        );

        Self {
            runtime,
            history,
            memory,
            crm,
            completion,
            email,
            session: SessionRecord::anonymous(),
        }
    }

    async fn turn(&self, message: &str) -> String {
        self.runtime.process_message(&self.session, message).await
    }

    async fn seed_lead(&self, fields: Value) -> i64 {
        let fields: Map<String, Value> = fields.as_object().cloned().expect("object literal");
        let rows = self.crm.insert(CrmTable::Leads, &fields).await.expect("seed lead");
        rows[0]["id"].as_i64().expect("id")
    }
}

#[tokio::test]
async fn greeting_turn_answers_without_memory_or_completion() {
    let harness = Harness::new();

    let response = harness.turn("hi").await;

    assert!(response.starts_with("Hi"), "fixed greeting text, got: {response}");
    assert_eq!(harness.completion.calls_made(), 0, "no completion call for greetings");
    assert_eq!(harness.history.reads(), 0, "history load skipped for greetings");

    let turns = harness.history.inner.all_turns().await;
    assert_eq!(turns.len(), 1, "the greeting pair is still persisted");
    assert_eq!(turns[0].source_type.map(|s| s.as_str().to_string()), Some("none".to_string()));
}

#[tokio::test]
async fn simple_list_queries_skip_the_history_read() {
    let harness = Harness::new();
    harness.seed_lead(json!({"name": "Asha Rao", "phone": "555-0101"})).await;
    harness.completion.push_text("1. Asha Rao\n   ID: 1");

    let _ = harness.turn("show all leads").await;

    assert_eq!(harness.history.reads(), 0, "list query should not pay the history read");
}

#[tokio::test]
async fn destructive_round_trip_requires_a_confirmation_turn() {
    let harness = Harness::new();
    let id = harness.seed_lead(json!({"name": "Asha Rao", "phone": "555-0101"})).await;

    // Turn 1: the completion service proposes the delete; it must not run.
    harness.completion.push_tool_call("delete_lead", json!({"lead_id": id.to_string()}));
    let response = harness.turn(&format!("delete lead {id}")).await;

    assert!(response.contains("confirm"), "expected a confirmation prompt, got: {response}");
    assert!(
        harness.crm.find_lead_by_id(id).await.expect("lookup").is_some(),
        "the lead must survive the proposing turn"
    );
    let pending = harness
        .memory
        .pending_action(&harness.session.session_id)
        .await
        .expect("load")
        .expect("pending action persisted");
    assert_eq!(pending.tool_name, "delete_lead");
    assert_eq!(pending.arguments, json!({"lead_id": id.to_string()}));

    // Turn 2: a bare confirmation executes the persisted arguments.
    let response = harness.turn("yes").await;

    assert!(
        harness.crm.find_lead_by_id(id).await.expect("lookup").is_none(),
        "the delete runs exactly once, after confirmation"
    );
    assert!(
        harness.memory.pending_action(&harness.session.session_id).await.expect("load").is_none(),
        "the pending action is cleared after execution"
    );
    let entity = harness
        .memory
        .entity_memory(&harness.session.session_id)
        .await
        .expect("load")
        .expect("entity memory written");
    assert_eq!(entity.entity_type, "lead");
    assert_eq!(entity.entity_id, id.to_string());
    assert_eq!(entity.action, EntityAction::Delete);
    assert!(response.to_lowercase().contains("delete"), "outcome is reported: {response}");
}

#[tokio::test]
async fn cancellation_never_executes_the_pending_action() {
    let harness = Harness::new();
    let id = harness.seed_lead(json!({"name": "Asha Rao", "phone": "555-0101"})).await;

    harness.completion.push_tool_call("delete_lead", json!({"lead_id": id.to_string()}));
    let _ = harness.turn(&format!("delete lead {id}")).await;

    let response = harness.turn("no, abort").await;

    assert!(
        harness.crm.find_lead_by_id(id).await.expect("lookup").is_some(),
        "cancellation must leave the lead untouched"
    );
    assert!(
        harness.memory.pending_action(&harness.session.session_id).await.expect("load").is_none(),
        "cancellation clears the slot"
    );
    assert!(response.to_lowercase().contains("cancel"), "got: {response}");
}

#[tokio::test]
async fn entity_memory_autofills_the_missing_identifier() {
    let harness = Harness::new();

    // Turn 1 creates a lead; entity memory now points at it.
    harness
        .completion
        .push_tool_call("create_lead", json!({"name": "Asha Rao", "phone": "555-0101"}));
    let _ = harness.turn("create a lead named Asha Rao, phone 555-0101").await;

    let entity = harness
        .memory
        .entity_memory(&harness.session.session_id)
        .await
        .expect("load")
        .expect("entity memory written");
    assert_eq!(entity.action, EntityAction::Create);
    let id: i64 = entity.entity_id.parse().expect("numeric id");

    // Turn 2 omits the id entirely; it is filled from memory.
    harness.completion.push_tool_call("update_lead", json!({"phone": "555-1234"}));
    let _ = harness.turn("update the phone to 555-1234").await;

    let updated = harness.crm.find_lead_by_id(id).await.expect("lookup").expect("lead");
    assert_eq!(updated["phone"], "555-1234");
}

#[tokio::test]
async fn silently_rejected_insert_is_reported_as_an_error() {
    let harness = Harness::new();
    harness.crm.set_reject_inserts(true);

    harness
        .completion
        .push_tool_call("create_lead", json!({"name": "Asha Rao", "phone": "555-0101"}));
    let response = harness.turn("create a lead named Asha Rao, phone 555-0101").await;

    assert!(
        response.contains("Error") || response.contains("failed"),
        "a write without a returned record must never read as success: {response}"
    );
    assert!(
        harness
            .memory
            .entity_memory(&harness.session.session_id)
            .await
            .expect("load")
            .is_none(),
        "no entity memory for a failed write"
    );
}

#[tokio::test]
async fn followup_route_renders_a_numbered_list_without_the_model() {
    let harness = Harness::new();
    harness
        .seed_lead(json!({
            "name": "Asha Rao",
            "phone": "555-0101",
            "lead_status": "Contacted",
            "next_follow_up": "2020-01-02T00:00:00+00:00",
        }))
        .await;
    harness
        .seed_lead(json!({
            "name": "Ravi Kumar",
            "phone": "555-0102",
            "lead_status": "Contacted",
            "next_follow_up": "2020-02-01T00:00:00+00:00",
        }))
        .await;

    let response = harness.turn("which leads need follow up today").await;

    assert!(response.contains("1. Asha Rao"));
    assert!(response.contains("2. Ravi Kumar"));
    assert!(response.contains("ID: 1"));
    assert_eq!(harness.completion.calls_made(), 0, "deterministic route bypasses the model");
}

#[tokio::test]
async fn contextual_reference_resolves_against_the_previous_list() {
    let harness = Harness::new();
    harness
        .seed_lead(json!({
            "name": "Asha Rao",
            "phone": "555-0101",
            "next_follow_up": "2020-01-02T00:00:00+00:00",
        }))
        .await;
    harness
        .seed_lead(json!({
            "name": "Ravi Kumar",
            "phone": "555-0102",
            "next_follow_up": "2020-02-01T00:00:00+00:00",
        }))
        .await;

    let _ = harness.turn("which leads need follow up today").await;
    let response = harness.turn("tell me about the second one").await;

    assert!(
        response.contains("Summary for lead Ravi Kumar"),
        "reference should resolve to the second listed lead: {response}"
    );
    assert_eq!(harness.completion.calls_made(), 0);
}

#[tokio::test]
async fn out_of_range_reference_asks_for_disambiguation() {
    let harness = Harness::new();
    harness
        .seed_lead(json!({
            "name": "Asha Rao",
            "phone": "555-0101",
            "next_follow_up": "2020-01-02T00:00:00+00:00",
        }))
        .await;

    let _ = harness.turn("which leads need follow up today").await;
    let response = harness.turn("tell me about the fifth one").await;

    assert!(
        response.contains("specify the name or ID"),
        "out-of-range references fail closed: {response}"
    );
}

#[tokio::test]
async fn send_email_route_delivers_and_records_the_message() {
    let harness = Harness::new();
    harness
        .seed_lead(json!({
            "name": "Asha Rao",
            "phone": "555-0101",
            "email": "asha@example.com",
            "lead_status": "Contacted",
        }))
        .await;

    let response = harness.turn("send email to lead Asha Rao").await;

    assert!(response.contains("Email sent to Asha Rao"), "got: {response}");

    let sent = harness.email.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "asha@example.com");
    assert!(sent[0].subject.contains("Asha Rao"));

    let recorded = harness.crm.rows(CrmTable::Emails).await;
    assert_eq!(recorded.len(), 1, "the sent mail is recorded in the CRM");
    assert_eq!(recorded[0]["recipient"], "asha@example.com");
}

#[tokio::test]
async fn email_transport_failure_is_an_apology_not_a_fake_success() {
    let harness = Harness::new();
    harness
        .seed_lead(json!({
            "name": "Asha Rao",
            "phone": "555-0101",
            "email": "asha@example.com",
        }))
        .await;
    harness.email.set_fail_sends(true);

    let response = harness.turn("send email to lead Asha Rao").await;

    assert!(!response.contains("Email sent"), "got: {response}");
    assert!(response.contains("sorry") || response.contains("wrong"), "got: {response}");
    assert!(harness.crm.rows(CrmTable::Emails).await.is_empty());
}

#[tokio::test]
async fn draft_route_renders_without_sending() {
    let harness = Harness::new();
    harness
        .seed_lead(json!({
            "name": "Asha Rao",
            "phone": "555-0101",
            "email": "asha@example.com",
        }))
        .await;

    let response = harness.turn("draft email for lead Asha Rao").await;

    assert!(response.contains("Subject:"));
    assert!(response.contains("Asha Rao"));
    assert!(harness.email.sent().await.is_empty(), "drafting never sends");
    assert_eq!(harness.completion.calls_made(), 0);
}

#[tokio::test]
async fn unknown_lead_summary_reports_not_found() {
    let harness = Harness::new();

    let response = harness.turn("give me a full summary of lead nobody").await;

    assert!(response.contains("couldn't find"), "got: {response}");
}

#[tokio::test]
async fn crm_read_queries_format_through_the_completion_service() {
    let harness = Harness::new();
    harness.seed_lead(json!({"name": "Asha Rao", "phone": "555-0101"})).await;
    harness.completion.push_text("You have one lead:\n1. Asha Rao\n   ID: 1");

    let response = harness.turn("show all leads").await;

    assert!(response.contains("Asha Rao"));
    assert_eq!(harness.completion.calls_made(), 1);
    let prompts = harness.completion.recorded_prompts();
    assert!(
        prompts[0].contains("Asha Rao"),
        "retrieved records are given to the model as context"
    );
}

#[tokio::test]
async fn empty_crm_read_stops_with_a_no_data_message() {
    let harness = Harness::new();

    let response = harness.turn("show all campaigns").await;

    assert!(response.contains("couldn't find any matching campaigns"), "got: {response}");
    assert_eq!(harness.completion.calls_made(), 0, "no completion call without context");
}

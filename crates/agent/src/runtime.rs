//! The conversation orchestrator: a fixed node graph that routes one user
//! turn through classification, memory loading, data retrieval, optional
//! tool calling with the confirmation protocol, and persistence.
//!
//! The node set and the transition function are closed enums, so an
//! unmapped state is a compile-time error. Every branch reaches `Persist`
//! in at most two completion-service invocations and one action-execution
//! pass: `tool_calls` is cleared unconditionally after execution and the
//! post-execution patch type cannot carry new calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use leadline_core::config::RuntimeConfig;
use leadline_core::domain::history::{turns_to_messages, ChatTurn, HistoryMessage};
use leadline_core::domain::session::{SessionId, SessionRecord};
use leadline_core::domain::turn::{RetrievedContext, SourceType, TurnPatch, TurnState};
use leadline_core::errors::AgentError;
use leadline_db::repositories::{
    AuditLogRepository, ChatHistoryRepository, ConversationMemoryRepository, CrmRepository, Page,
    SearchFilters,
};
use leadline_db::{with_backoff, RetryPolicy};

use crate::actions::ActionExecutor;
use crate::conversation::{
    classify, detect_action_intent, detect_table, extract_search_term, is_confirmation_reply,
    is_greeting, needs_history, normalize_query, GREETING_RESPONSE,
};
use crate::email::EmailTransport;
use crate::formatters::{
    format_action_results, format_followup_leads, format_lead_summary, render_email_draft,
};
use crate::llm::CompletionClient;
use crate::reference::{detect_reference, resolve};
use crate::tools::ToolRegistry;

const NO_RESPONSE_FALLBACK: &str = "I'm sorry, I couldn't generate a response.";
const CONTEXT_REFUSAL: &str = "I can only answer questions related to CRM data.";
const DISAMBIGUATION_PROMPT: &str =
    "I couldn't tell which item you meant. Please specify the name or ID.";
const LEAD_IDENTIFIER_PROMPT: &str =
    "I couldn't identify which lead you're asking about. Please specify the lead name or ID, \
     for example: 'Give me a full summary of lead Asha' or 'Show activity for lead ID 132'.";

/// Orchestrator tuning knobs derived from [`RuntimeConfig`]. None of these
/// change the control flow, only latency and resilience.
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    pub history_limit: u32,
    pub page_size: u32,
    pub turn_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub assistant_name: String,
    pub from_address: String,
}

impl RuntimeOptions {
    pub fn from_config(runtime: &RuntimeConfig, from_address: impl Into<String>) -> Self {
        Self {
            history_limit: runtime.history_limit,
            page_size: runtime.page_size,
            turn_timeout: runtime
                .timeout_enabled
                .then(|| Duration::from_secs(runtime.timeout_secs)),
            retry: RetryPolicy {
                enabled: runtime.retry_enabled,
                max_attempts: runtime.retry_max_attempts,
                initial_delay_ms: runtime.retry_initial_delay_ms,
            },
            assistant_name: "Leadline Assistant".to_string(),
            from_address: from_address.into(),
        }
    }
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            history_limit: 10,
            page_size: 25,
            turn_timeout: None,
            retry: RetryPolicy::default(),
            assistant_name: "Leadline Assistant".to_string(),
            from_address: "assistant@example.com".to_string(),
        }
    }
}

/// Graph nodes. `Persist` is the single terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GraphNode {
    Validate,
    ClassifyAndLoad,
    FetchFollowups,
    DraftEmail,
    SendEmail,
    LeadSummary,
    FetchRecords,
    CheckContext,
    CallCompletion,
    ExecuteAction,
    Persist,
}

/// Total transition function. A set `response` short-circuits to Persist
/// from every node.
fn next_node(current: GraphNode, state: &TurnState) -> GraphNode {
    use GraphNode::*;

    match current {
        Validate => {
            if state.has_response() {
                Persist
            } else {
                ClassifyAndLoad
            }
        }
        ClassifyAndLoad => {
            if state.has_response() {
                return Persist;
            }
            if state.requires_confirmation && state.pending_action.is_some() {
                // The pending-action reply goes straight to the completion
                // step, which hands it to the executor.
                return CallCompletion;
            }
            match state.source_type {
                Some(SourceType::Followup) => FetchFollowups,
                Some(SourceType::EmailDraft) => DraftEmail,
                Some(SourceType::SendEmail) => SendEmail,
                Some(SourceType::LeadSummary) => LeadSummary,
                _ => FetchRecords,
            }
        }
        // The dedicated formatter routes set their own response.
        FetchFollowups | DraftEmail | SendEmail | LeadSummary => Persist,
        FetchRecords => CheckContext,
        CheckContext => {
            if state.has_response() {
                Persist
            } else {
                CallCompletion
            }
        }
        CallCompletion => {
            if state.has_response() {
                Persist
            } else if !state.tool_calls.is_empty() {
                ExecuteAction
            } else if state.requires_confirmation && state.pending_action.is_some() {
                ExecuteAction
            } else {
                Persist
            }
        }
        ExecuteAction => CallCompletion,
        Persist => Persist,
    }
}

pub struct ConversationRuntime {
    history: Arc<dyn ChatHistoryRepository>,
    memory: Arc<dyn ConversationMemoryRepository>,
    crm: Arc<dyn CrmRepository>,
    audit: Arc<dyn AuditLogRepository>,
    completion: Arc<dyn CompletionClient>,
    email: Arc<dyn EmailTransport>,
    registry: ToolRegistry,
    options: RuntimeOptions,
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        history: Arc<dyn ChatHistoryRepository>,
        memory: Arc<dyn ConversationMemoryRepository>,
        crm: Arc<dyn CrmRepository>,
        audit: Arc<dyn AuditLogRepository>,
        completion: Arc<dyn CompletionClient>,
        email: Arc<dyn EmailTransport>,
        registry: ToolRegistry,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            history,
            memory,
            crm,
            audit,
            completion,
            email,
            registry,
            options,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serializes turns per session so two in-flight turns cannot race on
    /// the single-slot memory records.
    async fn session_guard(&self, session_id: &SessionId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.session_locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(session_id.0.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    fn audit_background(&self, session_id: &SessionId, state_admin: &str, action: &str, details: Value) {
        let audit = Arc::clone(&self.audit);
        let session_id = session_id.clone();
        let admin_id = leadline_core::domain::session::AdminId(state_admin.to_string());
        let action = action.to_string();
        tokio::spawn(async move {
            if let Err(error) =
                audit.log_action(Some(&session_id), &admin_id, &action, details).await
            {
                warn!(
                    event_name = "runtime.audit_failed",
                    session_id = %session_id,
                    action = %action,
                    error = %error,
                    "background audit write failed"
                );
            }
        });
    }

    /// Processes one user turn end-to-end and returns the reply text.
    pub async fn process_message(&self, session: &SessionRecord, user_message: &str) -> String {
        let _turn_guard = self.session_guard(&session.session_id).await;
        let started = Instant::now();

        self.audit_background(
            &session.session_id,
            &session.admin_id.0,
            "user_message_received",
            json!({"message_length": user_message.len()}),
        );

        let mut state =
            TurnState::new(session.session_id.clone(), session.admin_id.clone(), user_message);

        let response = match self.options.turn_timeout {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.run_graph(&mut state)).await {
                    Ok(()) => None,
                    Err(_) => {
                        warn!(
                            event_name = "runtime.turn_timeout",
                            session_id = %session.session_id,
                            timeout_secs = deadline.as_secs(),
                            "turn deadline exceeded"
                        );
                        self.audit_background(
                            &session.session_id,
                            &session.admin_id.0,
                            "request_timeout",
                            json!({"timeout_secs": deadline.as_secs()}),
                        );
                        Some(AgentError::Timeout(deadline.as_secs()).user_message())
                    }
                }
            }
            None => {
                self.run_graph(&mut state).await;
                None
            }
        };

        let response = response
            .or_else(|| state.response.clone())
            .unwrap_or_else(|| NO_RESPONSE_FALLBACK.to_string());
        let response_time_ms = started.elapsed().as_millis() as i64;

        let turn = ChatTurn {
            id: None,
            session_id: session.session_id.clone(),
            admin_id: session.admin_id.clone(),
            user_message: user_message.to_string(),
            assistant_response: response.clone(),
            source_type: state.source_type,
            response_time_ms: Some(response_time_ms),
            tokens_used: None,
            created_at: Utc::now(),
        };
        if let Err(error) = self.history.save_turn(turn).await {
            warn!(
                event_name = "runtime.history_save_failed",
                session_id = %session.session_id,
                error = %error,
                "failed to persist chat turn"
            );
            self.audit_background(
                &session.session_id,
                &session.admin_id.0,
                "chat_history_save_failed",
                json!({"error": error.to_string()}),
            );
        }

        self.audit_background(
            &session.session_id,
            &session.admin_id.0,
            "chat_completed",
            json!({
                "source_type": state.source_type.map(|source| source.as_str()),
                "response_time_ms": response_time_ms,
                "response_length": response.len(),
            }),
        );

        response
    }

    async fn run_graph(&self, state: &mut TurnState) {
        let mut node = GraphNode::Validate;
        loop {
            match node {
                GraphNode::Validate => {
                    let patch = validate_node(state);
                    state.apply(patch);
                }
                GraphNode::ClassifyAndLoad => {
                    let patch = self.classify_and_load_node(state).await;
                    state.apply(patch);
                }
                GraphNode::FetchFollowups => {
                    let patch = self.fetch_followups_node(state).await;
                    state.apply(patch);
                }
                GraphNode::DraftEmail => {
                    let patch = self.draft_email_node(state).await;
                    state.apply(patch);
                }
                GraphNode::SendEmail => {
                    let patch = self.send_email_node(state).await;
                    state.apply(patch);
                }
                GraphNode::LeadSummary => {
                    let patch = self.lead_summary_node(state).await;
                    state.apply(patch);
                }
                GraphNode::FetchRecords => {
                    let patch = self.fetch_records_node(state).await;
                    state.apply(patch);
                }
                GraphNode::CheckContext => {
                    let patch = check_context_node(state);
                    state.apply(patch);
                }
                GraphNode::CallCompletion => {
                    let patch = self.call_completion_node(state).await;
                    state.apply(patch);
                }
                GraphNode::ExecuteAction => {
                    let executor = ActionExecutor {
                        registry: &self.registry,
                        crm: self.crm.as_ref(),
                        memory: self.memory.as_ref(),
                        audit: self.audit.as_ref(),
                    };
                    let patch = executor.execute_turn(state).await;
                    state.apply_execution(patch);
                }
                GraphNode::Persist => break,
            }
            node = next_node(node, state);
        }
    }

    /// Classification, contextual-reference resolution, conditional history
    /// loading, and restoration of the persisted memory slots.
    async fn classify_and_load_node(&self, state: &TurnState) -> TurnPatch {
        let user_message = state.user_message.as_str();
        let source = classify(user_message);

        if source == SourceType::None {
            info!(
                event_name = "runtime.greeting_detected",
                session_id = %state.session_id,
                "greeting detected, skipping data retrieval"
            );
            return TurnPatch {
                conversation_history: Some(Vec::new()),
                ..TurnPatch::response(GREETING_RESPONSE).with_source(SourceType::None)
            };
        }

        let mut patch = TurnPatch::default().with_source(source);

        let mut history_messages: Vec<HistoryMessage> = Vec::new();
        if needs_history(user_message) {
            match self.history.recent_turns(&state.session_id, self.options.history_limit).await {
                Ok(turns) => {
                    history_messages = turns_to_messages(&turns);
                    patch.conversation_history = Some(history_messages.clone());
                }
                Err(error) => {
                    // Non-critical: proceed with empty history.
                    warn!(
                        event_name = "runtime.history_load_failed",
                        session_id = %state.session_id,
                        error = %error,
                        "failed to load conversation history"
                    );
                }
            }
        } else {
            patch.conversation_history = Some(Vec::new());
        }

        match self.memory.entity_memory(&state.session_id).await {
            Ok(Some(memory)) => patch.entity_memory = Some(Some(memory)),
            Ok(None) => {}
            Err(error) => warn!(
                event_name = "runtime.entity_memory_load_failed",
                session_id = %state.session_id,
                error = %error,
                "failed to load entity memory"
            ),
        }

        match self.memory.pending_action(&state.session_id).await {
            Ok(Some(pending)) => {
                if is_confirmation_reply(user_message) {
                    info!(
                        event_name = "runtime.pending_action_restored",
                        session_id = %state.session_id,
                        tool_name = %pending.tool_name,
                        "restored pending action for confirmation"
                    );
                    patch.pending_action = Some(Some(pending));
                    patch.requires_confirmation = Some(true);
                    return patch;
                }

                // Any other utterance settles the pending action as
                // cancelled; the new query proceeds normally.
                info!(
                    event_name = "runtime.pending_action_discarded",
                    session_id = %state.session_id,
                    tool_name = %pending.tool_name,
                    "pending action discarded by unrelated utterance"
                );
                if let Err(error) = self.memory.clear_pending_action(&state.session_id).await {
                    warn!(
                        event_name = "runtime.pending_clear_failed",
                        session_id = %state.session_id,
                        error = %error,
                        "failed to clear discarded pending action"
                    );
                }
            }
            Ok(None) => {}
            Err(error) => warn!(
                event_name = "runtime.pending_action_load_failed",
                session_id = %state.session_id,
                error = %error,
                "failed to load pending action"
            ),
        }

        // Positional/pronoun references turn a CRM query into a lead
        // lookup. Action turns keep their verbs; the executor auto-fills
        // identifiers from entity memory instead.
        let is_action = detect_action_intent(user_message, false);
        if !is_action
            && matches!(source, SourceType::Crm | SourceType::LeadSummary)
            && detect_reference(user_message).is_some()
        {
            match resolve(user_message, &history_messages) {
                Some(identifier) => {
                    info!(
                        event_name = "runtime.reference_resolved",
                        session_id = %state.session_id,
                        identifier = %identifier,
                        "contextual reference resolved"
                    );
                    patch.source_type = Some(SourceType::LeadSummary);
                    patch.lead_identifier = Some(identifier);
                }
                None => {
                    // Fail closed: ask, never guess an index.
                    patch.response = Some(DISAMBIGUATION_PROMPT.to_string());
                }
            }
        }

        patch
    }

    async fn fetch_followups_node(&self, state: &TurnState) -> TurnPatch {
        let leads = with_backoff(self.options.retry, || {
            self.crm.leads_requiring_followup(Utc::now())
        })
        .await;

        match leads {
            Ok(leads) => {
                info!(
                    event_name = "runtime.followups_fetched",
                    session_id = %state.session_id,
                    count = leads.len(),
                    "fetched leads requiring follow-up"
                );
                let response = format_followup_leads(&leads);
                TurnPatch {
                    retrieved_context: Some(RetrievedContext::Records {
                        table: "leads".to_string(),
                        rows: leads,
                    }),
                    ..TurnPatch::response(response).with_source(SourceType::Followup)
                }
            }
            Err(error) => {
                warn!(
                    event_name = "runtime.followups_failed",
                    session_id = %state.session_id,
                    error = %error,
                    "follow-up query failed"
                );
                TurnPatch::response(AgentError::Upstream(error.to_string()).user_message())
                    .with_source(SourceType::Followup)
            }
        }
    }

    async fn find_lead(&self, identifier: &str) -> Result<Option<Value>, AgentError> {
        let result = if let Ok(id) = identifier.trim().parse::<i64>() {
            with_backoff(self.options.retry, || self.crm.find_lead_by_id(id)).await
        } else {
            with_backoff(self.options.retry, || self.crm.find_lead_by_name(identifier)).await
        };
        result.map_err(|error| AgentError::Upstream(error.to_string()))
    }

    async fn lead_summary_node(&self, state: &TurnState) -> TurnPatch {
        let identifier = state
            .lead_identifier
            .clone()
            .or_else(|| extract_lead_identifier(&state.user_message));
        let Some(identifier) = identifier else {
            return TurnPatch::response(LEAD_IDENTIFIER_PROMPT)
                .with_source(SourceType::LeadSummary);
        };

        let lead = match self.find_lead(&identifier).await {
            Ok(lead) => lead,
            Err(error) => {
                warn!(
                    event_name = "runtime.lead_lookup_failed",
                    session_id = %state.session_id,
                    error = %error,
                    "lead lookup failed"
                );
                return TurnPatch::response(error.user_message())
                    .with_source(SourceType::LeadSummary);
            }
        };
        let Some(lead) = lead else {
            let not_found = AgentError::NotFound(format!("a lead matching `{identifier}`"));
            return TurnPatch::response(not_found.user_message())
                .with_source(SourceType::LeadSummary);
        };

        let lead_id = lead.get("id").and_then(Value::as_i64).unwrap_or_default();
        let activity = match with_backoff(self.options.retry, || self.crm.lead_activity(lead_id))
            .await
        {
            Ok(activity) => activity,
            Err(error) => {
                warn!(
                    event_name = "runtime.lead_activity_failed",
                    session_id = %state.session_id,
                    error = %error,
                    "activity lookup failed"
                );
                return TurnPatch::response(
                    AgentError::Upstream(error.to_string()).user_message(),
                )
                .with_source(SourceType::LeadSummary);
            }
        };

        let response = format_lead_summary(&lead, &activity);
        TurnPatch {
            retrieved_context: Some(RetrievedContext::Summary(lead)),
            ..TurnPatch::response(response).with_source(SourceType::LeadSummary)
        }
    }

    async fn draft_email_node(&self, state: &TurnState) -> TurnPatch {
        let identifier = state
            .lead_identifier
            .clone()
            .or_else(|| extract_lead_identifier(&state.user_message));
        let Some(identifier) = identifier else {
            return TurnPatch::response(LEAD_IDENTIFIER_PROMPT)
                .with_source(SourceType::EmailDraft);
        };

        let lead = match self.find_lead(&identifier).await {
            Ok(Some(lead)) => lead,
            Ok(None) => {
                let not_found = AgentError::NotFound(format!("a lead matching `{identifier}`"));
                return TurnPatch::response(not_found.user_message())
                    .with_source(SourceType::EmailDraft);
            }
            Err(error) => {
                return TurnPatch::response(error.user_message())
                    .with_source(SourceType::EmailDraft)
            }
        };

        match render_email_draft(&lead, &self.options.assistant_name) {
            Ok(draft) => {
                let response = format!(
                    "Here's a draft you can review:\n\nSubject: {}\n\n{}\n\nSay 'send it' when \
                     you're ready.",
                    draft.subject, draft.body
                );
                TurnPatch {
                    retrieved_context: Some(RetrievedContext::Summary(lead)),
                    ..TurnPatch::response(response).with_source(SourceType::EmailDraft)
                }
            }
            Err(error) => {
                warn!(
                    event_name = "runtime.draft_render_failed",
                    session_id = %state.session_id,
                    error = %error,
                    "email draft rendering failed"
                );
                TurnPatch::response(AgentError::Upstream(error.to_string()).user_message())
                    .with_source(SourceType::EmailDraft)
            }
        }
    }

    async fn send_email_node(&self, state: &TurnState) -> TurnPatch {
        let identifier = state
            .lead_identifier
            .clone()
            .or_else(|| extract_lead_identifier(&state.user_message));
        let Some(identifier) = identifier else {
            return TurnPatch::response(LEAD_IDENTIFIER_PROMPT)
                .with_source(SourceType::SendEmail);
        };

        let lead = match self.find_lead(&identifier).await {
            Ok(Some(lead)) => lead,
            Ok(None) => {
                let not_found = AgentError::NotFound(format!("a lead matching `{identifier}`"));
                return TurnPatch::response(not_found.user_message())
                    .with_source(SourceType::SendEmail);
            }
            Err(error) => {
                return TurnPatch::response(error.user_message())
                    .with_source(SourceType::SendEmail)
            }
        };

        let Some(address) = lead.get("email").and_then(Value::as_str).filter(|a| !a.is_empty())
        else {
            return TurnPatch::response(
                "That lead has no email address on file, so I can't send anything.",
            )
            .with_source(SourceType::SendEmail);
        };

        let draft = match render_email_draft(&lead, &self.options.assistant_name) {
            Ok(draft) => draft,
            Err(error) => {
                return TurnPatch::response(
                    AgentError::Upstream(error.to_string()).user_message(),
                )
                .with_source(SourceType::SendEmail)
            }
        };

        if let Err(error) = self.email.send(address, &draft.subject, &draft.body).await {
            warn!(
                event_name = "runtime.email_send_failed",
                session_id = %state.session_id,
                error = %error,
                "email delivery failed"
            );
            let response = match error {
                crate::email::EmailError::Disabled => {
                    "Email sending isn't configured on this server.".to_string()
                }
                other => AgentError::Upstream(other.to_string()).user_message(),
            };
            return TurnPatch::response(response).with_source(SourceType::SendEmail);
        }

        // Record the sent mail; a failed record write is logged but the
        // send itself already happened.
        let email_row = json!({
            "subject": draft.subject,
            "recipient": address,
            "sender": self.options.from_address,
            "body": draft.body,
            "lead_id": lead.get("id").cloned().unwrap_or(Value::Null),
        });
        if let Some(fields) = email_row.as_object() {
            if let Err(error) =
                self.crm.insert(leadline_db::repositories::CrmTable::Emails, fields).await
            {
                warn!(
                    event_name = "runtime.email_record_failed",
                    session_id = %state.session_id,
                    error = %error,
                    "failed to record sent email"
                );
            }
        }

        let name = lead.get("name").and_then(Value::as_str).unwrap_or("the lead");
        TurnPatch::response(format!("Email sent to {name} <{address}>."))
            .with_source(SourceType::SendEmail)
    }

    async fn fetch_records_node(&self, state: &TurnState) -> TurnPatch {
        let table = detect_table(&state.user_message);
        // Action turns fetch an unfiltered context page: their wording is
        // an instruction, not a search term.
        let term = if detect_action_intent(&state.user_message, false) {
            None
        } else {
            extract_search_term(&state.user_message)
        };
        let filters = SearchFilters { term };
        let page = Page::first(self.options.page_size);

        let rows =
            with_backoff(self.options.retry, || self.crm.search(table, &filters, page)).await;

        match rows {
            Ok(rows) => {
                info!(
                    event_name = "runtime.records_fetched",
                    session_id = %state.session_id,
                    table = table.as_str(),
                    count = rows.len(),
                    "fetched records"
                );
                TurnPatch {
                    retrieved_context: Some(RetrievedContext::Records {
                        table: table.as_str().to_string(),
                        rows,
                    }),
                    source_type: Some(SourceType::Crm),
                    ..TurnPatch::default()
                }
            }
            Err(error) => {
                warn!(
                    event_name = "runtime.records_fetch_failed",
                    session_id = %state.session_id,
                    table = table.as_str(),
                    error = %error,
                    "record fetch failed"
                );
                TurnPatch::response(AgentError::Upstream(error.to_string()).user_message())
                    .with_source(SourceType::Crm)
            }
        }
    }

    async fn call_completion_node(&self, state: &TurnState) -> TurnPatch {
        if state.has_response() {
            return TurnPatch::default();
        }

        // Phrase freshly-executed action results; tool calls were already
        // cleared, so this is the final completion call of the turn.
        if !state.action_results.is_empty() {
            let deterministic = format_action_results(&state.action_results);
            let system_prompt = phrasing_system_prompt(&state.action_results);
            let messages = [HistoryMessage::admin(state.user_message.clone())];
            return match self.completion.generate(&system_prompt, &messages).await {
                Ok(text) => TurnPatch::response(text),
                Err(error) => {
                    warn!(
                        event_name = "runtime.result_phrasing_failed",
                        session_id = %state.session_id,
                        error = %error,
                        "falling back to deterministic action-result text"
                    );
                    TurnPatch::response(deterministic)
                }
            };
        }

        let has_pending = state.requires_confirmation && state.pending_action.is_some();
        if has_pending && is_confirmation_reply(&state.user_message) {
            // Confirmation replies bypass the model entirely; the executor
            // settles the persisted action.
            return TurnPatch::default();
        }

        if detect_action_intent(&state.user_message, has_pending) {
            let system_prompt = action_system_prompt(state);
            let mut messages = state.conversation_history.clone();
            messages.push(HistoryMessage::admin(state.user_message.clone()));

            return match self
                .completion
                .generate_with_tools(&system_prompt, &messages, &self.registry.schemas())
                .await
            {
                Ok(outcome) if !outcome.tool_calls.is_empty() => TurnPatch {
                    tool_calls: Some(outcome.tool_calls),
                    ..TurnPatch::default()
                },
                Ok(outcome) => TurnPatch::response(
                    outcome.text.unwrap_or_else(|| NO_RESPONSE_FALLBACK.to_string()),
                ),
                Err(error) => {
                    warn!(
                        event_name = "runtime.tool_call_failed",
                        session_id = %state.session_id,
                        error = %error,
                        "function-calling completion failed"
                    );
                    TurnPatch::response(AgentError::Upstream(error.to_string()).user_message())
                }
            };
        }

        // Plain formatting mode only ever speaks from fetched context.
        if state.context_is_empty() && !is_greeting(&state.user_message) {
            info!(
                event_name = "runtime.completion_refused",
                session_id = %state.session_id,
                "blocked completion call without context"
            );
            return TurnPatch::response(CONTEXT_REFUSAL);
        }

        let system_prompt = formatting_system_prompt(state);
        let mut messages = state.conversation_history.clone();
        messages.push(HistoryMessage::admin(state.user_message.clone()));

        match self.completion.generate(&system_prompt, &messages).await {
            Ok(text) => TurnPatch::response(text),
            Err(error) => {
                warn!(
                    event_name = "runtime.completion_failed",
                    session_id = %state.session_id,
                    error = %error,
                    "formatting completion failed"
                );
                TurnPatch::response(AgentError::Upstream(error.to_string()).user_message())
            }
        }
    }
}

fn validate_node(state: &TurnState) -> TurnPatch {
    if state.session_id.0.trim().is_empty() {
        return TurnPatch::response("Your session could not be identified. Please reload and try again.");
    }
    if state.user_message.trim().is_empty() {
        return TurnPatch::response("Please enter a message.");
    }
    TurnPatch::default()
}

fn check_context_node(state: &TurnState) -> TurnPatch {
    if state.has_response() {
        return TurnPatch::default();
    }

    // Mutating instructions proceed even against an empty table; the
    // no-data stop only applies to read queries.
    if detect_action_intent(&state.user_message, false) {
        return TurnPatch::default();
    }

    if state.context_is_empty() {
        let table = match &state.retrieved_context {
            Some(RetrievedContext::Records { table, .. }) => table.as_str(),
            _ => "records",
        };
        return TurnPatch::response(format!(
            "I couldn't find any matching {table} in the CRM. Try a different name or filter."
        ));
    }

    TurnPatch::default()
}

fn action_system_prompt(state: &TurnState) -> String {
    let mut memory_context = String::new();
    if let Some(memory) = &state.entity_memory {
        memory_context.push_str(&format!(
            "\n\nConversation context (use these values if the user doesn't specify):\n\
             Last {} ID: {}",
            memory.entity_type, memory.entity_id
        ));
        if let Some(name) = &memory.entity_name {
            memory_context.push_str(&format!("\nLast {} name: {name}", memory.entity_type));
        }
        memory_context.push_str(&format!(
            "\n\nWhen the user says 'update it', 'change the phone', 'delete that', and so on, \
             use the last {} ID ({}) from context. Do NOT ask for the ID again if it is already \
             in context.",
            memory.entity_type, memory.entity_id
        ));
    }

    format!(
        "You are Leadline, an assistant for CRM operations.\n\
         You can create, update, and delete leads, campaigns, tasks, and notes.\n\n\
         When the user wants to perform an action:\n\
         1. Use the appropriate function\n\
         2. Extract all required information from the user's message\n\
         3. If information is missing, check the conversation context below\n\
         4. If still missing, ask the user for it\n\
         5. Only call functions when you have enough information{memory_context}"
    )
}

fn formatting_system_prompt(state: &TurnState) -> String {
    let context_json = match &state.retrieved_context {
        Some(RetrievedContext::Records { rows, .. }) => {
            serde_json::to_string(rows).unwrap_or_else(|_| "[]".to_string())
        }
        Some(RetrievedContext::Summary(value)) => {
            serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
        }
        None => "[]".to_string(),
    };

    format!(
        "You are Leadline, an assistant for CRM data. Answer the user's question using ONLY the \
         records below. Render lists as numbered lists with an `ID:` line per item. If the \
         records don't contain the answer, say so; never invent data.\n\nRecords (JSON):\n\
         {context_json}"
    )
}

fn phrasing_system_prompt(results: &[leadline_core::domain::turn::ActionResult]) -> String {
    let results_json = serde_json::to_string(results).unwrap_or_else(|_| "[]".to_string());
    format!(
        "The following CRM actions were just executed. Summarize the outcome for the user in \
         one or two sentences. Mention only identifiers present in the results; never invent \
         IDs, and do not propose further actions.\n\nResults (JSON):\n{results_json}"
    )
}

/// Pulls a lead id or name out of a summary/draft query. Id patterns win
/// over names; a short keyword-free query is treated as a bare name.
fn extract_lead_identifier(message: &str) -> Option<String> {
    let normalized = normalize_query(message);
    let tokens: Vec<&str> = normalized.split_whitespace().collect();

    // "lead id 132", "id 132", "lead 132"
    for window in tokens.windows(2) {
        if let [keyword, value] = window {
            if (*keyword == "id" || *keyword == "lead") && value.chars().all(|c| c.is_ascii_digit())
            {
                return Some((*value).to_string());
            }
        }
    }

    if !tokens.is_empty() && tokens.iter().all(|token| token.chars().all(|c| c.is_ascii_digit())) {
        return Some(tokens.join(""));
    }

    // "lead <name...>" up to a connective.
    if let Some(position) = tokens.iter().position(|token| *token == "lead") {
        let stop_words = ["and", "with", "id", "summary", "activity", "history", "full"];
        let name: Vec<&str> = tokens[position + 1..]
            .iter()
            .take_while(|token| !stop_words.contains(*token))
            .copied()
            .collect();
        if !name.is_empty() {
            return Some(name.join(" "));
        }
    }

    // A short query with no routing keywords is itself the name.
    let keywords = ["summary", "activity", "lead", "id", "history", "draft", "email", "send"];
    if tokens.len() <= 3 && !tokens.iter().any(|token| keywords.contains(token)) {
        return Some(tokens.join(" "));
    }

    None
}

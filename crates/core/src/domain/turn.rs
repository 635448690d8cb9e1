use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::history::HistoryMessage;
use crate::domain::memory::{EntityMemory, PendingAction};
use crate::domain::session::{AdminId, SessionId};

/// Routing tag deciding which data-fetch and formatting path a turn takes.
///
/// Serialized as the snake_case tag because the value is persisted on chat
/// history rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Greeting turns: no data source is consulted at all.
    None,
    SendEmail,
    Followup,
    EmailDraft,
    LeadSummary,
    Crm,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SendEmail => "send_email",
            Self::Followup => "followup",
            Self::EmailDraft => "email_draft",
            Self::LeadSummary => "lead_summary",
            Self::Crm => "crm",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(Self::None),
            "send_email" => Some(Self::SendEmail),
            "followup" => Some(Self::Followup),
            "email_draft" => Some(Self::EmailDraft),
            "lead_summary" => Some(Self::LeadSummary),
            "crm" => Some(Self::Crm),
            _ => None,
        }
    }
}

/// Result of the data-fetch step; the shape varies by route.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RetrievedContext {
    /// Generic table query: the record list plus the table it came from.
    Records { table: String, rows: Vec<Value> },
    /// Single-entity summary object (lead summary route).
    Summary(Value),
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Records { rows, .. } => rows.is_empty(),
            Self::Summary(value) => value.is_null(),
        }
    }
}

/// A function call proposed by the completion service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Error,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub tool_name: String,
    pub status: ActionStatus,
    /// Present on success: the record returned by the store, or
    /// `{"deleted": true}` for boolean delete results.
    pub result: Option<Value>,
    /// Present on error or cancellation.
    pub error: Option<String>,
}

impl ActionResult {
    pub fn success(tool_name: impl Into<String>, result: Value) -> Self {
        Self { tool_name: tool_name.into(), status: ActionStatus::Success, result: Some(result), error: None }
    }

    pub fn error(tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self { tool_name: tool_name.into(), status: ActionStatus::Error, result: None, error: Some(error.into()) }
    }

    pub fn cancelled(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: ActionStatus::Cancelled,
            result: None,
            error: Some("Action cancelled by user".to_string()),
        }
    }
}

/// The mutable record threaded through the orchestration graph for one
/// user turn. Every field is enumerated here; nodes communicate by
/// returning a sparse [`TurnPatch`] which the orchestrator applies
/// field-by-field, so only touched fields change.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnState {
    pub session_id: SessionId,
    pub admin_id: AdminId,
    pub user_message: String,
    pub conversation_history: Vec<HistoryMessage>,
    pub retrieved_context: Option<RetrievedContext>,
    pub source_type: Option<SourceType>,
    pub response: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub action_results: Vec<ActionResult>,
    pub requires_confirmation: bool,
    pub pending_action: Option<PendingAction>,
    pub entity_memory: Option<EntityMemory>,
    pub lead_identifier: Option<String>,
}

impl TurnState {
    pub fn new(session_id: SessionId, admin_id: AdminId, user_message: impl Into<String>) -> Self {
        Self {
            session_id,
            admin_id,
            user_message: user_message.into(),
            conversation_history: Vec::new(),
            retrieved_context: None,
            source_type: None,
            response: None,
            tool_calls: Vec::new(),
            action_results: Vec::new(),
            requires_confirmation: false,
            pending_action: None,
            entity_memory: None,
            lead_identifier: None,
        }
    }

    /// A non-empty response short-circuits the remaining graph steps.
    pub fn has_response(&self) -> bool {
        self.response.as_deref().map(|text| !text.is_empty()).unwrap_or(false)
    }

    pub fn context_is_empty(&self) -> bool {
        self.retrieved_context.as_ref().map(RetrievedContext::is_empty).unwrap_or(true)
    }

    pub fn apply(&mut self, patch: TurnPatch) {
        if let Some(history) = patch.conversation_history {
            self.conversation_history = history;
        }
        if let Some(context) = patch.retrieved_context {
            self.retrieved_context = Some(context);
        }
        if let Some(source_type) = patch.source_type {
            self.source_type = Some(source_type);
        }
        if let Some(response) = patch.response {
            self.response = Some(response);
        }
        if let Some(tool_calls) = patch.tool_calls {
            self.tool_calls = tool_calls;
        }
        if let Some(requires_confirmation) = patch.requires_confirmation {
            self.requires_confirmation = requires_confirmation;
        }
        if let Some(pending_action) = patch.pending_action {
            self.pending_action = pending_action;
        }
        if let Some(entity_memory) = patch.entity_memory {
            self.entity_memory = entity_memory;
        }
        if let Some(lead_identifier) = patch.lead_identifier {
            self.lead_identifier = Some(lead_identifier);
        }
    }

    /// Applies the outcome of the action-execution step. The patch type has
    /// no tool-call field at all, and `tool_calls` is cleared here
    /// unconditionally, so the execute -> phrase loop cannot recurse.
    pub fn apply_execution(&mut self, patch: ExecutionPatch) {
        self.tool_calls.clear();
        self.action_results = patch.action_results;
        self.requires_confirmation = patch.requires_confirmation;
        self.pending_action = patch.pending_action;
        if let Some(entity_memory) = patch.entity_memory {
            self.entity_memory = Some(entity_memory);
        }
        if let Some(response) = patch.response {
            self.response = Some(response);
        }
    }
}

/// Sparse update returned by a graph node. `None` means "leave the field
/// alone"; the doubly-wrapped slots distinguish "set" from "clear".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TurnPatch {
    pub conversation_history: Option<Vec<HistoryMessage>>,
    pub retrieved_context: Option<RetrievedContext>,
    pub source_type: Option<SourceType>,
    pub response: Option<String>,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub requires_confirmation: Option<bool>,
    pub pending_action: Option<Option<PendingAction>>,
    pub entity_memory: Option<Option<EntityMemory>>,
    pub lead_identifier: Option<String>,
}

impl TurnPatch {
    pub fn response(text: impl Into<String>) -> Self {
        Self { response: Some(text.into()), ..Self::default() }
    }

    pub fn with_source(mut self, source_type: SourceType) -> Self {
        self.source_type = Some(source_type);
        self
    }
}

/// Outcome of the action-execution step. Deliberately has no `tool_calls`
/// field: execution can never re-propose calls, which bounds the graph.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionPatch {
    pub action_results: Vec<ActionResult>,
    pub requires_confirmation: bool,
    pub pending_action: Option<PendingAction>,
    pub entity_memory: Option<EntityMemory>,
    pub response: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::domain::memory::PendingAction;
    use crate::domain::session::{AdminId, SessionId};

    use super::{
        ActionResult, ActionStatus, ExecutionPatch, RetrievedContext, SourceType, ToolCallRequest,
        TurnPatch, TurnState,
    };

    fn state_fixture(message: &str) -> TurnState {
        TurnState::new(SessionId("s-1".to_string()), AdminId::anonymous(), message)
    }

    #[test]
    fn source_type_round_trips_through_persisted_tag() {
        for tag in [
            SourceType::None,
            SourceType::SendEmail,
            SourceType::Followup,
            SourceType::EmailDraft,
            SourceType::LeadSummary,
            SourceType::Crm,
        ] {
            assert_eq!(SourceType::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(SourceType::parse("rag"), None);
    }

    #[test]
    fn patch_only_touches_named_fields() {
        let mut state = state_fixture("delete lead 42");
        state.source_type = Some(SourceType::Crm);

        state.apply(TurnPatch {
            tool_calls: Some(vec![ToolCallRequest {
                name: "delete_lead".to_string(),
                arguments: json!({"lead_id": "42"}),
            }]),
            ..TurnPatch::default()
        });

        assert_eq!(state.source_type, Some(SourceType::Crm));
        assert_eq!(state.tool_calls.len(), 1);
        assert!(state.response.is_none());
    }

    #[test]
    fn patch_can_clear_pending_action() {
        let mut state = state_fixture("yes");
        state.pending_action = Some(PendingAction::new("delete_lead", json!({"lead_id": "42"})));
        state.requires_confirmation = true;

        state.apply(TurnPatch {
            pending_action: Some(None),
            requires_confirmation: Some(false),
            ..TurnPatch::default()
        });

        assert!(state.pending_action.is_none());
        assert!(!state.requires_confirmation);
    }

    #[test]
    fn execution_patch_always_clears_tool_calls() {
        let mut state = state_fixture("delete lead 42");
        state.tool_calls = vec![ToolCallRequest {
            name: "delete_lead".to_string(),
            arguments: json!({"lead_id": "42"}),
        }];

        state.apply_execution(ExecutionPatch {
            action_results: vec![ActionResult::success("delete_lead", json!({"deleted": true}))],
            ..ExecutionPatch::default()
        });

        assert!(state.tool_calls.is_empty());
        assert_eq!(state.action_results[0].status, ActionStatus::Success);
    }

    #[test]
    fn empty_context_detection_covers_both_shapes() {
        let mut state = state_fixture("show leads");
        assert!(state.context_is_empty());

        state.retrieved_context =
            Some(RetrievedContext::Records { table: "leads".to_string(), rows: vec![] });
        assert!(state.context_is_empty());

        state.retrieved_context = Some(RetrievedContext::Records {
            table: "leads".to_string(),
            rows: vec![json!({"id": 1})],
        });
        assert!(!state.context_is_empty());
    }
}

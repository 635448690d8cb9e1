//! Action execution with the destructive-action confirmation protocol.
//!
//! Per turn: `NO_ACTION -> VALIDATING -> {CONFIRM_PENDING, EXECUTING} ->
//! {SUCCESS, ERROR, CANCELLED}`. A destructive call never executes on the
//! turn that proposed it; it is parked as the session's pending action and
//! only runs after an explicit confirmation token on a later turn.

use serde_json::{json, Value};
use tracing::{info, warn};

use leadline_core::domain::memory::{EntityAction, EntityMemory, PendingAction};
use leadline_core::domain::turn::{ActionResult, ExecutionPatch, ToolCallRequest, TurnState};
use leadline_db::repositories::{AuditLogRepository, ConversationMemoryRepository, CrmRepository};

use crate::conversation::is_confirmed;
use crate::tools::{ToolKind, ToolOutcome, ToolRegistry};

pub struct ActionExecutor<'a> {
    pub registry: &'a ToolRegistry,
    pub crm: &'a dyn CrmRepository,
    pub memory: &'a dyn ConversationMemoryRepository,
    pub audit: &'a dyn AuditLogRepository,
}

fn humanize_tool_name(tool_name: &str) -> String {
    tool_name.replace('_', " ")
}

fn confirmation_prompt(tool_name: &str) -> String {
    format!(
        "I'm about to {}. This action cannot be undone. Please confirm by saying 'yes' or \
         'confirm' to proceed.",
        humanize_tool_name(tool_name)
    )
}

fn record_id(record: &Value) -> Option<String> {
    match record.get("id") {
        Some(Value::Number(number)) => Some(number.to_string()),
        Some(Value::String(raw)) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
        _ => None,
    }
}

fn record_name(record: &Value) -> Option<String> {
    ["name", "title", "subject", "email"]
        .iter()
        .find_map(|field| record.get(*field).and_then(Value::as_str))
        .map(|name| name.to_string())
}

impl<'a> ActionExecutor<'a> {
    /// Runs the proposed tool calls (or the confirmed pending action)
    /// against the record store. The returned patch carries no tool calls
    /// by construction.
    pub async fn execute_turn(&self, state: &TurnState) -> ExecutionPatch {
        let mut tool_calls = state.tool_calls.clone();
        let mut confirmed_this_turn = false;

        if state.requires_confirmation {
            if let Some(pending) = &state.pending_action {
                match self.settle_pending_action(state, pending).await {
                    PendingResolution::Execute(call) => {
                        tool_calls = vec![call];
                        confirmed_this_turn = true;
                    }
                    PendingResolution::Finished(patch) => return patch,
                }
            }
        }

        if tool_calls.is_empty() {
            return ExecutionPatch::default();
        }

        let mut results: Vec<ActionResult> = Vec::new();
        let mut remembered_entity: Option<EntityMemory> = None;

        for call in &tool_calls {
            let mut arguments = call.arguments.clone();
            self.autofill_identifier(state, &call.name, &mut arguments);

            if let Err(message) = self.registry.validate_call(&call.name, &arguments) {
                warn!(
                    event_name = "action.validation_failed",
                    session_id = %state.session_id,
                    tool_name = %call.name,
                    error = %message,
                    "rejecting invalid tool call"
                );
                self.audit_action(
                    state,
                    "tool_call_validation_failed",
                    json!({"tool_name": call.name, "error": message, "arguments": arguments}),
                )
                .await;
                results.push(ActionResult::error(&call.name, message));
                continue;
            }

            if self.registry.is_destructive(&call.name) && !confirmed_this_turn {
                return self.park_destructive_call(state, &call.name, arguments).await;
            }

            match self.registry.execute(self.crm, &call.name, &arguments).await {
                Ok(outcome) => {
                    let result =
                        self.settle_outcome(state, &call.name, &arguments, outcome).await;
                    if let Some(memory) = result.1 {
                        remembered_entity = Some(memory);
                    }
                    results.push(result.0);
                }
                Err(error) => {
                    // Real store errors propagate as-is; success is never
                    // synthesized from a failed call.
                    let message = error.to_string();
                    warn!(
                        event_name = "action.execution_failed",
                        session_id = %state.session_id,
                        tool_name = %call.name,
                        error = %message,
                        "tool execution failed"
                    );
                    self.audit_action(
                        state,
                        "tool_execution_error",
                        json!({"tool_name": call.name, "error": message}),
                    )
                    .await;
                    results.push(ActionResult::error(&call.name, message));
                }
            }
        }

        ExecutionPatch {
            action_results: results,
            requires_confirmation: false,
            pending_action: None,
            entity_memory: remembered_entity,
            response: None,
        }
    }

    /// Confirms or cancels the persisted pending action. The persisted slot
    /// is re-read and its correlation token compared before executing, so a
    /// racing turn that replaced the slot cannot be cross-executed.
    async fn settle_pending_action(
        &self,
        state: &TurnState,
        pending: &PendingAction,
    ) -> PendingResolution {
        if !is_confirmed(&state.user_message) {
            info!(
                event_name = "action.cancelled",
                session_id = %state.session_id,
                tool_name = %pending.tool_name,
                "destructive action cancelled by user"
            );
            if let Err(error) = self.memory.clear_pending_action(&state.session_id).await {
                warn!(
                    event_name = "action.pending_clear_failed",
                    session_id = %state.session_id,
                    error = %error,
                    "failed to clear pending action after cancellation"
                );
            }
            return PendingResolution::Finished(ExecutionPatch {
                action_results: vec![ActionResult::cancelled(&pending.tool_name)],
                requires_confirmation: false,
                pending_action: None,
                entity_memory: None,
                response: None,
            });
        }

        let stored = match self.memory.pending_action(&state.session_id).await {
            Ok(stored) => stored,
            Err(error) => {
                warn!(
                    event_name = "action.pending_read_failed",
                    session_id = %state.session_id,
                    error = %error,
                    "failed to re-read pending action before execution"
                );
                None
            }
        };

        match stored {
            Some(stored) if stored.token == pending.token => {
                if let Err(error) = self.memory.clear_pending_action(&state.session_id).await {
                    warn!(
                        event_name = "action.pending_clear_failed",
                        session_id = %state.session_id,
                        error = %error,
                        "failed to clear pending action after confirmation"
                    );
                }
                PendingResolution::Execute(ToolCallRequest {
                    name: stored.tool_name,
                    arguments: stored.arguments,
                })
            }
            _ => PendingResolution::Finished(ExecutionPatch {
                action_results: vec![ActionResult::error(
                    &pending.tool_name,
                    "The pending action changed before it could be confirmed. Please retry.",
                )],
                requires_confirmation: false,
                pending_action: None,
                entity_memory: None,
                response: None,
            }),
        }
    }

    /// Parks a destructive call as the session's pending action and emits
    /// the confirmation prompt. The slot write is awaited: the prompt must
    /// not be shown unless the pending action is durable.
    async fn park_destructive_call(
        &self,
        state: &TurnState,
        tool_name: &str,
        arguments: Value,
    ) -> ExecutionPatch {
        let pending = PendingAction::new(tool_name, arguments);
        if let Err(error) =
            self.memory.save_pending_action(&state.session_id, pending.clone()).await
        {
            warn!(
                event_name = "action.pending_save_failed",
                session_id = %state.session_id,
                tool_name = %tool_name,
                error = %error,
                "failed to persist pending action"
            );
            return ExecutionPatch {
                action_results: vec![ActionResult::error(
                    tool_name,
                    "Could not stage the destructive action for confirmation. Please try again.",
                )],
                requires_confirmation: false,
                pending_action: None,
                entity_memory: None,
                response: None,
            };
        }

        info!(
            event_name = "action.confirmation_requested",
            session_id = %state.session_id,
            tool_name = %tool_name,
            "destructive action parked pending confirmation"
        );

        let prompt = confirmation_prompt(tool_name);
        ExecutionPatch {
            action_results: Vec::new(),
            requires_confirmation: true,
            pending_action: Some(pending),
            entity_memory: None,
            response: Some(prompt),
        }
    }

    /// Fills a missing `{entity}_id` argument from entity memory when the
    /// remembered entity type matches the tool's target.
    fn autofill_identifier(&self, state: &TurnState, tool_name: &str, arguments: &mut Value) {
        let Some(tool) = self.registry.get(tool_name) else {
            return;
        };
        if matches!(tool.kind, ToolKind::Create) {
            return;
        }
        let Some(memory) = &state.entity_memory else {
            return;
        };
        if memory.entity_type != tool.entity() {
            return;
        }

        let id_field = tool.id_field();
        let Some(object) = arguments.as_object_mut() else {
            return;
        };
        let missing = match object.get(&id_field) {
            None | Some(Value::Null) => true,
            Some(Value::String(raw)) => raw.trim().is_empty(),
            Some(_) => false,
        };
        if missing {
            info!(
                event_name = "action.identifier_autofilled",
                session_id = %state.session_id,
                tool_name = %tool_name,
                entity_id = %memory.entity_id,
                "filled missing identifier from entity memory"
            );
            object.insert(id_field, Value::String(memory.entity_id.clone()));
        }
    }

    /// Applies the success-shape rules: deletes must have removed a row,
    /// creates/updates must return a record with a non-empty id. Anything
    /// else is an error, never a fabricated success.
    async fn settle_outcome(
        &self,
        state: &TurnState,
        tool_name: &str,
        arguments: &Value,
        outcome: ToolOutcome,
    ) -> (ActionResult, Option<EntityMemory>) {
        let Some(tool) = self.registry.get(tool_name) else {
            return (ActionResult::error(tool_name, format!("Unknown tool: {tool_name}")), None);
        };

        match outcome {
            ToolOutcome::Deleted(true) => {
                let entity_id = arguments
                    .get(tool.id_field())
                    .map(|value| match value {
                        Value::String(raw) => raw.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default();

                let memory = (!entity_id.is_empty())
                    .then(|| EntityMemory::new(tool.entity(), entity_id, EntityAction::Delete));
                let remembered = self.remember_entity(state, memory).await;

                self.audit_action(
                    state,
                    &format!("tool_executed_{tool_name}"),
                    json!({"tool_name": tool_name, "arguments": arguments}),
                )
                .await;
                (ActionResult::success(tool_name, json!({"deleted": true})), remembered)
            }
            ToolOutcome::Deleted(false) => (
                ActionResult::error(tool_name, "Action returned false (operation failed)"),
                None,
            ),
            ToolOutcome::Record(Some(record)) => match record_id(&record) {
                Some(id) => {
                    let action = if matches!(tool.kind, ToolKind::Create) {
                        EntityAction::Create
                    } else {
                        EntityAction::Update
                    };
                    let mut memory = EntityMemory::new(tool.entity(), id.clone(), action);
                    if let Some(name) = record_name(&record) {
                        memory = memory.with_name(name);
                    }
                    let remembered = self.remember_entity(state, Some(memory)).await;

                    self.audit_action(
                        state,
                        &format!("tool_executed_{tool_name}"),
                        json!({"tool_name": tool_name, "result_id": id}),
                    )
                    .await;
                    (ActionResult::success(tool_name, record), remembered)
                }
                None => (
                    ActionResult::error(
                        tool_name,
                        "Action returned invalid result: missing 'id' field (database \
                         persistence not confirmed)",
                    ),
                    None,
                ),
            },
            ToolOutcome::Record(None) => (
                ActionResult::error(
                    tool_name,
                    "Action returned no record (database persistence not confirmed)",
                ),
                None,
            ),
        }
    }

    /// Entity-memory writes gate later auto-fill; they are awaited, not
    /// deferred.
    async fn remember_entity(
        &self,
        state: &TurnState,
        memory: Option<EntityMemory>,
    ) -> Option<EntityMemory> {
        let memory = memory?;
        match self.memory.save_entity_memory(&state.session_id, memory.clone()).await {
            Ok(()) => Some(memory),
            Err(error) => {
                warn!(
                    event_name = "action.entity_memory_save_failed",
                    session_id = %state.session_id,
                    error = %error,
                    "failed to persist entity memory"
                );
                Some(memory)
            }
        }
    }

    async fn audit_action(&self, state: &TurnState, action: &str, details: Value) {
        if let Err(error) =
            self.audit.log_action(Some(&state.session_id), &state.admin_id, action, details).await
        {
            warn!(
                event_name = "action.audit_failed",
                session_id = %state.session_id,
                error = %error,
                "failed to append audit log entry"
            );
        }
    }
}

enum PendingResolution {
    Execute(ToolCallRequest),
    Finished(ExecutionPatch),
}

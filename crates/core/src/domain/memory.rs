use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Mutating action that produced an entity-memory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    Create,
    Update,
    Delete,
}

impl EntityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// The most recent entity a mutating operation touched, one slot per
/// session. Overwritten by the next mutation; no history is retained.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMemory {
    pub entity_type: String,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub action: EntityAction,
}

impl EntityMemory {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: EntityAction,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            entity_name: None,
            action,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }
}

/// A destructive tool call awaiting an explicit confirmation turn.
///
/// The `token` correlates the persisted slot with the in-flight turn that
/// created it: the confirm step re-reads the slot and refuses to execute
/// when the token no longer matches, so two racing confirmations on the
/// same session cannot cross-execute each other's action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    pub tool_name: String,
    pub arguments: Value,
    pub token: String,
}

impl PendingAction {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            token: Uuid::new_v4().simple().to_string(),
        }
    }
}

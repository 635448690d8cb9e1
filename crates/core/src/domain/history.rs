use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::{AdminId, SessionId};
use crate::domain::turn::SourceType;

/// Role of a single reconstructed history message. The store keeps
/// (user, assistant) pairs; each pair expands to two messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

impl HistoryMessage {
    pub fn admin(content: impl Into<String>) -> Self {
        Self { role: Role::Admin, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// One persisted request/response pair of the chat endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: Option<i64>,
    pub session_id: SessionId,
    pub admin_id: AdminId,
    pub user_message: String,
    pub assistant_response: String,
    pub source_type: Option<SourceType>,
    pub response_time_ms: Option<i64>,
    pub tokens_used: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl ChatTurn {
    /// Expands the stored pair into chronological messages (user first).
    pub fn to_messages(&self) -> [HistoryMessage; 2] {
        [
            HistoryMessage::admin(self.user_message.clone()),
            HistoryMessage::assistant(self.assistant_response.clone()),
        ]
    }
}

/// Flattens stored pairs, oldest first, into the message list the
/// orchestrator threads through a turn.
pub fn turns_to_messages(turns: &[ChatTurn]) -> Vec<HistoryMessage> {
    let mut messages = Vec::with_capacity(turns.len() * 2);
    for turn in turns {
        let [user, assistant] = turn.to_messages();
        messages.push(user);
        messages.push(assistant);
    }
    messages
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::domain::session::{AdminId, SessionId};
    use crate::domain::turn::SourceType;

    use super::{turns_to_messages, ChatTurn, Role};

    fn turn_fixture(user: &str, assistant: &str) -> ChatTurn {
        ChatTurn {
            id: None,
            session_id: SessionId("s-1".to_string()),
            admin_id: AdminId::anonymous(),
            user_message: user.to_string(),
            assistant_response: assistant.to_string(),
            source_type: Some(SourceType::Crm),
            response_time_ms: Some(12),
            tokens_used: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn pairs_expand_to_two_messages_in_order() {
        let messages = turns_to_messages(&[
            turn_fixture("show all leads", "1. Asha\n2. Ravi"),
            turn_fixture("tell me about the first one", "Asha: ..."),
        ]);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::Admin);
        assert_eq!(messages[0].content, "show all leads");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[3].content, "Asha: ...");
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use leadline_core::domain::history::ChatTurn;
use leadline_core::domain::memory::{EntityMemory, PendingAction};
use leadline_core::domain::session::{AdminId, SessionId, SessionRecord};

pub mod audit_log;
pub mod chat_history;
pub mod conversation_memory;
pub mod crm;
pub mod memory;
pub mod session;

pub use audit_log::SqlAuditLogRepository;
pub use chat_history::SqlChatHistoryRepository;
pub use conversation_memory::SqlConversationMemoryRepository;
pub use crm::SqlCrmRepository;
pub use memory::{
    InMemoryAuditLogRepository, InMemoryChatHistoryRepository, InMemoryConversationMemoryRepository,
    InMemoryCrmRepository, InMemorySessionRepository,
};
pub use session::SqlSessionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// CRM tables the assistant can query and mutate. The table set is closed;
/// unknown names never reach SQL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CrmTable {
    Leads,
    Campaigns,
    Tasks,
    Notes,
    Emails,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Text,
}

#[derive(Clone, Copy, Debug)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn text(name: &'static str) -> Column {
    Column { name, kind: ColumnKind::Text }
}

const fn integer(name: &'static str) -> Column {
    Column { name, kind: ColumnKind::Integer }
}

impl CrmTable {
    pub const ALL: [CrmTable; 5] =
        [Self::Leads, Self::Campaigns, Self::Tasks, Self::Notes, Self::Emails];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leads => "leads",
            Self::Campaigns => "campaigns",
            Self::Tasks => "tasks",
            Self::Notes => "notes",
            Self::Emails => "emails",
        }
    }

    /// The singular entity term tools are named after (`create_lead`,
    /// `delete_campaign`).
    pub fn entity(&self) -> &'static str {
        match self {
            Self::Leads => "lead",
            Self::Campaigns => "campaign",
            Self::Tasks => "task",
            Self::Notes => "note",
            Self::Emails => "email",
        }
    }

    pub fn for_entity(entity: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.entity() == entity)
    }

    /// Matches a singular-collapsed query token against a table. `prospect`
    /// and `enquiry` are lead synonyms; `todo` maps to tasks.
    pub fn parse_term(term: &str) -> Option<Self> {
        match term {
            "lead" | "prospect" | "enquiry" | "inquiry" => Some(Self::Leads),
            "campaign" => Some(Self::Campaigns),
            "task" | "todo" => Some(Self::Tasks),
            "note" | "comment" => Some(Self::Notes),
            "email" | "mail" => Some(Self::Emails),
            _ => None,
        }
    }

    /// Every column of the table, id first. Row decoding and dynamic
    /// insert/update statements are driven from this list.
    pub fn columns(&self) -> &'static [Column] {
        match self {
            Self::Leads => &[
                integer("id"),
                text("name"),
                text("email"),
                text("phone"),
                text("lead_status"),
                text("lead_stage"),
                text("lead_source"),
                text("lead_owner"),
                text("next_follow_up"),
                text("description"),
                text("created_at"),
                text("updated_at"),
            ],
            Self::Campaigns => &[
                integer("id"),
                text("name"),
                text("status"),
                text("type"),
                text("campaign_owner"),
                text("campaign_date"),
                text("end_date"),
                text("phone"),
                text("description"),
                text("created_at"),
                text("updated_at"),
            ],
            Self::Tasks => &[
                integer("id"),
                text("subject"),
                text("priority"),
                text("status"),
                text("task_type"),
                text("due_date"),
                integer("lead_id"),
                text("created_at"),
                text("updated_at"),
            ],
            Self::Notes => &[
                integer("id"),
                text("content"),
                integer("lead_id"),
                text("created_at"),
                text("updated_at"),
            ],
            Self::Emails => &[
                integer("id"),
                text("subject"),
                text("recipient"),
                text("sender"),
                text("body"),
                integer("lead_id"),
                text("created_at"),
                text("updated_at"),
            ],
        }
    }

    /// Columns the free-text search term is matched against.
    pub fn search_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Leads => &[
                "name",
                "email",
                "phone",
                "lead_status",
                "lead_stage",
                "lead_source",
                "lead_owner",
            ],
            Self::Campaigns => &["name", "status", "type", "campaign_owner", "phone"],
            Self::Tasks => &["subject", "priority", "status", "task_type"],
            Self::Notes => &["content"],
            Self::Emails => &["subject", "recipient", "sender"],
        }
    }

    /// Columns a caller may set on insert/update. Ids and timestamps are
    /// owned by the repository.
    pub fn writable_fields(&self) -> Vec<&'static str> {
        self.columns()
            .iter()
            .map(|column| column.name)
            .filter(|name| !matches!(*name, "id" | "created_at" | "updated_at"))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub fn first(limit: u32) -> Self {
        Self { limit, offset: 0 }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchFilters {
    /// Free-text term matched against the table's search fields with LIKE.
    pub term: Option<String>,
}

/// Activity rows related to one lead, used by the summary and draft routes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeadActivity {
    pub tasks: Vec<Value>,
    pub notes: Vec<Value>,
    pub emails: Vec<Value>,
}

impl LeadActivity {
    pub fn total(&self) -> usize {
        self.tasks.len() + self.notes.len() + self.emails.len()
    }
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn find(&self, id: &SessionId) -> Result<Option<SessionRecord>, RepositoryError>;
    async fn create(&self, record: SessionRecord) -> Result<(), RepositoryError>;
    async fn touch(&self, id: &SessionId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ChatHistoryRepository: Send + Sync {
    /// Most recent pairs for the session, oldest first.
    async fn recent_turns(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<ChatTurn>, RepositoryError>;

    async fn save_turn(&self, turn: ChatTurn) -> Result<(), RepositoryError>;

    async fn count_turns(&self, session_id: &SessionId) -> Result<i64, RepositoryError>;
}

#[async_trait]
pub trait ConversationMemoryRepository: Send + Sync {
    async fn entity_memory(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<EntityMemory>, RepositoryError>;

    async fn save_entity_memory(
        &self,
        session_id: &SessionId,
        memory: EntityMemory,
    ) -> Result<(), RepositoryError>;

    async fn clear_entity_memory(&self, session_id: &SessionId) -> Result<(), RepositoryError>;

    async fn pending_action(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<PendingAction>, RepositoryError>;

    async fn save_pending_action(
        &self,
        session_id: &SessionId,
        action: PendingAction,
    ) -> Result<(), RepositoryError>;

    async fn clear_pending_action(&self, session_id: &SessionId) -> Result<(), RepositoryError>;
}

/// Generic filter/paginate/insert/update/delete over the CRM tables.
///
/// Mutations return the affected rows; success is signaled by a non-empty
/// row list, never by the mere absence of an error.
#[async_trait]
pub trait CrmRepository: Send + Sync {
    async fn search(
        &self,
        table: CrmTable,
        filters: &SearchFilters,
        page: Page,
    ) -> Result<Vec<Value>, RepositoryError>;

    async fn insert(
        &self,
        table: CrmTable,
        fields: &Map<String, Value>,
    ) -> Result<Vec<Value>, RepositoryError>;

    async fn update(
        &self,
        table: CrmTable,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<Vec<Value>, RepositoryError>;

    async fn delete(&self, table: CrmTable, id: &str) -> Result<Vec<Value>, RepositoryError>;

    async fn find_lead_by_id(&self, id: i64) -> Result<Option<Value>, RepositoryError>;

    async fn find_lead_by_name(&self, name: &str) -> Result<Option<Value>, RepositoryError>;

    /// Leads with `next_follow_up <= now` and a status that is not
    /// Closed/Lost, ordered by follow-up date ascending.
    async fn leads_requiring_followup(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Value>, RepositoryError>;

    async fn lead_activity(&self, lead_id: i64) -> Result<LeadActivity, RepositoryError>;
}

#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    async fn log_action(
        &self,
        session_id: Option<&SessionId>,
        admin_id: &AdminId,
        action: &str,
        details: Value,
    ) -> Result<(), RepositoryError>;
}

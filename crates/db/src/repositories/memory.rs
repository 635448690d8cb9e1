use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use leadline_core::domain::history::ChatTurn;
use leadline_core::domain::memory::{EntityMemory, PendingAction};
use leadline_core::domain::session::{AdminId, SessionId, SessionRecord};

use super::{
    AuditLogRepository, ChatHistoryRepository, ConversationMemoryRepository, CrmRepository,
    CrmTable, LeadActivity, Page, RepositoryError, SearchFilters, SessionRepository,
};

#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

#[async_trait::async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn find(&self, id: &SessionId) -> Result<Option<SessionRecord>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id.0).cloned())
    }

    async fn create(&self, record: SessionRecord) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(record.session_id.0.clone(), record);
        Ok(())
    }

    async fn touch(&self, id: &SessionId) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions.get_mut(&id.0) {
            record.last_activity_at = Utc::now();
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryChatHistoryRepository {
    turns: RwLock<Vec<ChatTurn>>,
}

impl InMemoryChatHistoryRepository {
    pub async fn all_turns(&self) -> Vec<ChatTurn> {
        self.turns.read().await.clone()
    }
}

#[async_trait::async_trait]
impl ChatHistoryRepository for InMemoryChatHistoryRepository {
    async fn recent_turns(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<ChatTurn>, RepositoryError> {
        let turns = self.turns.read().await;
        let mut matching: Vec<ChatTurn> =
            turns.iter().filter(|turn| turn.session_id == *session_id).cloned().collect();
        let keep = limit as usize;
        if matching.len() > keep {
            matching = matching.split_off(matching.len() - keep);
        }
        Ok(matching)
    }

    async fn save_turn(&self, turn: ChatTurn) -> Result<(), RepositoryError> {
        let mut turns = self.turns.write().await;
        turns.push(turn);
        Ok(())
    }

    async fn count_turns(&self, session_id: &SessionId) -> Result<i64, RepositoryError> {
        let turns = self.turns.read().await;
        Ok(turns.iter().filter(|turn| turn.session_id == *session_id).count() as i64)
    }
}

#[derive(Default)]
pub struct InMemoryConversationMemoryRepository {
    entity_memory: RwLock<HashMap<String, EntityMemory>>,
    pending_actions: RwLock<HashMap<String, PendingAction>>,
}

#[async_trait::async_trait]
impl ConversationMemoryRepository for InMemoryConversationMemoryRepository {
    async fn entity_memory(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<EntityMemory>, RepositoryError> {
        let slots = self.entity_memory.read().await;
        Ok(slots.get(&session_id.0).cloned())
    }

    async fn save_entity_memory(
        &self,
        session_id: &SessionId,
        memory: EntityMemory,
    ) -> Result<(), RepositoryError> {
        let mut slots = self.entity_memory.write().await;
        slots.insert(session_id.0.clone(), memory);
        Ok(())
    }

    async fn clear_entity_memory(&self, session_id: &SessionId) -> Result<(), RepositoryError> {
        let mut slots = self.entity_memory.write().await;
        slots.remove(&session_id.0);
        Ok(())
    }

    async fn pending_action(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        let slots = self.pending_actions.read().await;
        Ok(slots.get(&session_id.0).cloned())
    }

    async fn save_pending_action(
        &self,
        session_id: &SessionId,
        action: PendingAction,
    ) -> Result<(), RepositoryError> {
        let mut slots = self.pending_actions.write().await;
        slots.insert(session_id.0.clone(), action);
        Ok(())
    }

    async fn clear_pending_action(&self, session_id: &SessionId) -> Result<(), RepositoryError> {
        let mut slots = self.pending_actions.write().await;
        slots.remove(&session_id.0);
        Ok(())
    }
}

/// In-memory record store with the same success contract as the SQL
/// implementation: mutations return the affected rows.
///
/// `reject_inserts` makes inserts return an empty row list while still
/// reporting no error, imitating a silently-rejected write (the shape the
/// no-fabrication checks in the action executor must catch).
#[derive(Default)]
pub struct InMemoryCrmRepository {
    tables: RwLock<HashMap<CrmTable, Vec<Value>>>,
    next_id: AtomicI64,
    reject_inserts: AtomicBool,
}

impl InMemoryCrmRepository {
    pub fn set_reject_inserts(&self, reject: bool) {
        self.reject_inserts.store(reject, Ordering::SeqCst);
    }

    pub async fn rows(&self, table: CrmTable) -> Vec<Value> {
        let tables = self.tables.read().await;
        tables.get(&table).cloned().unwrap_or_default()
    }

    fn normalize_fields(
        table: CrmTable,
        fields: &Map<String, Value>,
    ) -> Result<Map<String, Value>, RepositoryError> {
        let writable = table.writable_fields();
        let mut normalized = Map::new();
        for (key, value) in fields {
            if !writable.contains(&key.as_str()) {
                return Err(RepositoryError::Decode(format!(
                    "unknown column `{key}` for table `{}`",
                    table.as_str()
                )));
            }
            normalized.insert(key.clone(), value.clone());
        }
        Ok(normalized)
    }
}

fn row_matches_term(row: &Value, table: CrmTable, term: &str) -> bool {
    let needle = term.to_lowercase();
    table.search_fields().iter().any(|field| {
        row.get(*field)
            .and_then(Value::as_str)
            .map(|value| value.to_lowercase().contains(&needle))
            .unwrap_or(false)
    })
}

#[async_trait::async_trait]
impl CrmRepository for InMemoryCrmRepository {
    async fn search(
        &self,
        table: CrmTable,
        filters: &SearchFilters,
        page: Page,
    ) -> Result<Vec<Value>, RepositoryError> {
        let tables = self.tables.read().await;
        let rows = tables.get(&table).cloned().unwrap_or_default();

        let filtered: Vec<Value> = rows
            .into_iter()
            .rev()
            .filter(|row| match filters.term.as_deref() {
                Some(term) if !term.trim().is_empty() => row_matches_term(row, table, term.trim()),
                _ => true,
            })
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();

        Ok(filtered)
    }

    async fn insert(
        &self,
        table: CrmTable,
        fields: &Map<String, Value>,
    ) -> Result<Vec<Value>, RepositoryError> {
        let mut row = Self::normalize_fields(table, fields)?;
        if self.reject_inserts.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now().to_rfc3339();
        row.insert("id".to_string(), Value::from(id));
        row.insert("created_at".to_string(), Value::from(now.clone()));
        row.insert("updated_at".to_string(), Value::from(now));

        let value = Value::Object(row);
        let mut tables = self.tables.write().await;
        tables.entry(table).or_default().push(value.clone());
        Ok(vec![value])
    }

    async fn update(
        &self,
        table: CrmTable,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<Vec<Value>, RepositoryError> {
        let updates = Self::normalize_fields(table, fields)?;
        let Ok(row_id) = id.trim().parse::<i64>() else {
            return Ok(Vec::new());
        };

        let mut tables = self.tables.write().await;
        let rows = tables.entry(table).or_default();
        for row in rows.iter_mut() {
            if row.get("id").and_then(Value::as_i64) == Some(row_id) {
                if let Some(object) = row.as_object_mut() {
                    for (key, value) in &updates {
                        object.insert(key.clone(), value.clone());
                    }
                    object
                        .insert("updated_at".to_string(), Value::from(Utc::now().to_rfc3339()));
                }
                return Ok(vec![row.clone()]);
            }
        }
        Ok(Vec::new())
    }

    async fn delete(&self, table: CrmTable, id: &str) -> Result<Vec<Value>, RepositoryError> {
        let Ok(row_id) = id.trim().parse::<i64>() else {
            return Ok(Vec::new());
        };

        let mut tables = self.tables.write().await;
        let rows = tables.entry(table).or_default();
        let before = rows.len();
        let mut removed = Vec::new();
        rows.retain(|row| {
            if row.get("id").and_then(Value::as_i64) == Some(row_id) {
                removed.push(row.clone());
                false
            } else {
                true
            }
        });
        debug_assert!(rows.len() + removed.len() == before);
        Ok(removed)
    }

    async fn find_lead_by_id(&self, id: i64) -> Result<Option<Value>, RepositoryError> {
        let tables = self.tables.read().await;
        let rows = tables.get(&CrmTable::Leads).cloned().unwrap_or_default();
        Ok(rows.into_iter().find(|row| row.get("id").and_then(Value::as_i64) == Some(id)))
    }

    async fn find_lead_by_name(&self, name: &str) -> Result<Option<Value>, RepositoryError> {
        let tables = self.tables.read().await;
        let rows = tables.get(&CrmTable::Leads).cloned().unwrap_or_default();
        let needle = name.trim().to_lowercase();

        let exact = rows.iter().find(|row| {
            row.get("name")
                .and_then(Value::as_str)
                .map(|value| value.to_lowercase() == needle)
                .unwrap_or(false)
        });
        if let Some(row) = exact {
            return Ok(Some(row.clone()));
        }

        Ok(rows
            .into_iter()
            .find(|row| {
                row.get("name")
                    .and_then(Value::as_str)
                    .map(|value| value.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            }))
    }

    async fn leads_requiring_followup(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Value>, RepositoryError> {
        let cutoff = now.to_rfc3339();
        let tables = self.tables.read().await;
        let rows = tables.get(&CrmTable::Leads).cloned().unwrap_or_default();

        let mut due: Vec<Value> = rows
            .into_iter()
            .filter(|row| {
                let has_due_date = row
                    .get("next_follow_up")
                    .and_then(Value::as_str)
                    .map(|date| date <= cutoff.as_str())
                    .unwrap_or(false);
                let open_status = row
                    .get("lead_status")
                    .and_then(Value::as_str)
                    .map(|status| status != "Closed" && status != "Lost")
                    .unwrap_or(true);
                has_due_date && open_status
            })
            .collect();

        due.sort_by(|left, right| {
            let left_date = left.get("next_follow_up").and_then(Value::as_str).unwrap_or("");
            let right_date = right.get("next_follow_up").and_then(Value::as_str).unwrap_or("");
            left_date.cmp(right_date)
        });
        Ok(due)
    }

    async fn lead_activity(&self, lead_id: i64) -> Result<LeadActivity, RepositoryError> {
        let tables = self.tables.read().await;
        let related = |table: CrmTable| -> Vec<Value> {
            tables
                .get(&table)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|row| row.get("lead_id").and_then(Value::as_i64) == Some(lead_id))
                .collect()
        };

        Ok(LeadActivity {
            tasks: related(CrmTable::Tasks),
            notes: related(CrmTable::Notes),
            emails: related(CrmTable::Emails),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuditEntry {
    pub session_id: Option<String>,
    pub admin_id: String,
    pub action: String,
    pub details: Value,
}

#[derive(Default)]
pub struct InMemoryAuditLogRepository {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditLogRepository {
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait::async_trait]
impl AuditLogRepository for InMemoryAuditLogRepository {
    async fn log_action(
        &self,
        session_id: Option<&SessionId>,
        admin_id: &AdminId,
        action: &str,
        details: Value,
    ) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.push(AuditEntry {
            session_id: session_id.map(|id| id.0.clone()),
            admin_id: admin_id.0.clone(),
            action: action.to_string(),
            details,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use leadline_core::domain::session::SessionId;

    use crate::repositories::{
        ChatHistoryRepository, CrmRepository, CrmTable, InMemoryChatHistoryRepository,
        InMemoryCrmRepository, Page, SearchFilters,
    };

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object literal")
    }

    #[tokio::test]
    async fn in_memory_crm_mirrors_the_row_list_contract() {
        let repo = InMemoryCrmRepository::default();
        let created = repo
            .insert(CrmTable::Leads, &fields(json!({"name": "Asha", "phone": "1"})))
            .await
            .expect("insert");
        assert_eq!(created.len(), 1);
        let id = created[0]["id"].as_i64().expect("id").to_string();

        let updated = repo
            .update(CrmTable::Leads, &id, &fields(json!({"phone": "2"})))
            .await
            .expect("update");
        assert_eq!(updated[0]["phone"], "2");

        let deleted = repo.delete(CrmTable::Leads, &id).await.expect("delete");
        assert_eq!(deleted.len(), 1);
        assert!(repo.delete(CrmTable::Leads, &id).await.expect("redelete").is_empty());
    }

    #[tokio::test]
    async fn rejected_inserts_return_an_empty_row_list_without_error() {
        let repo = InMemoryCrmRepository::default();
        repo.set_reject_inserts(true);

        let rows = repo
            .insert(CrmTable::Leads, &fields(json!({"name": "Asha", "phone": "1"})))
            .await
            .expect("insert call itself succeeds");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn search_respects_term_and_page() {
        let repo = InMemoryCrmRepository::default();
        for name in ["Asha", "Ravi", "Meena"] {
            repo.insert(CrmTable::Leads, &fields(json!({"name": name, "phone": "1"})))
                .await
                .expect("insert");
        }

        let hit = repo
            .search(
                CrmTable::Leads,
                &SearchFilters { term: Some("rav".to_string()) },
                Page::first(10),
            )
            .await
            .expect("search");
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0]["name"], "Ravi");

        let page = repo
            .search(CrmTable::Leads, &SearchFilters::default(), Page { limit: 2, offset: 1 })
            .await
            .expect("page");
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn chat_history_limit_keeps_latest_pairs() {
        let repo = InMemoryChatHistoryRepository::default();
        let session = SessionId("s-1".to_string());
        for index in 0..5 {
            repo.save_turn(leadline_core::domain::history::ChatTurn {
                id: None,
                session_id: session.clone(),
                admin_id: leadline_core::domain::session::AdminId::anonymous(),
                user_message: format!("q{index}"),
                assistant_response: format!("a{index}"),
                source_type: None,
                response_time_ms: None,
                tokens_used: None,
                created_at: chrono::Utc::now(),
            })
            .await
            .expect("save");
        }

        let turns = repo.recent_turns(&session, 2).await.expect("load");
        let questions: Vec<&str> = turns.iter().map(|turn| turn.user_message.as_str()).collect();
        assert_eq!(questions, vec!["q3", "q4"]);
    }
}

use chrono::Utc;
use sqlx::Row;

use leadline_core::domain::memory::{EntityAction, EntityMemory, PendingAction};
use leadline_core::domain::session::SessionId;

use super::{ConversationMemoryRepository, RepositoryError};
use crate::DbPool;

/// Single-slot cross-turn memory: last-touched entity and pending
/// destructive action, one row per session, overwritten in place.
pub struct SqlConversationMemoryRepository {
    pool: DbPool,
}

impl SqlConversationMemoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationMemoryRepository for SqlConversationMemoryRepository {
    async fn entity_memory(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<EntityMemory>, RepositoryError> {
        let row = sqlx::query(
            "SELECT entity_type, entity_id, entity_name, action
             FROM entity_memory WHERE session_id = ?",
        )
        .bind(&session_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let action_raw = row.get::<String, _>("action");
        let action = EntityAction::parse(&action_raw).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown entity action `{action_raw}`"))
        })?;

        Ok(Some(EntityMemory {
            entity_type: row.get::<String, _>("entity_type"),
            entity_id: row.get::<String, _>("entity_id"),
            entity_name: row.get::<Option<String>, _>("entity_name"),
            action,
        }))
    }

    async fn save_entity_memory(
        &self,
        session_id: &SessionId,
        memory: EntityMemory,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO entity_memory (session_id, entity_type, entity_id, entity_name, action, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                entity_type = excluded.entity_type,
                entity_id = excluded.entity_id,
                entity_name = excluded.entity_name,
                action = excluded.action,
                updated_at = excluded.updated_at",
        )
        .bind(&session_id.0)
        .bind(&memory.entity_type)
        .bind(&memory.entity_id)
        .bind(&memory.entity_name)
        .bind(memory.action.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_entity_memory(&self, session_id: &SessionId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM entity_memory WHERE session_id = ?")
            .bind(&session_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_action(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        let row = sqlx::query(
            "SELECT tool_name, arguments_json, token FROM pending_action WHERE session_id = ?",
        )
        .bind(&session_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let arguments_json = row.get::<String, _>("arguments_json");
        let arguments = serde_json::from_str(&arguments_json)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        Ok(Some(PendingAction {
            tool_name: row.get::<String, _>("tool_name"),
            arguments,
            token: row.get::<String, _>("token"),
        }))
    }

    async fn save_pending_action(
        &self,
        session_id: &SessionId,
        action: PendingAction,
    ) -> Result<(), RepositoryError> {
        let arguments_json = serde_json::to_string(&action.arguments)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO pending_action (session_id, tool_name, arguments_json, token, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                tool_name = excluded.tool_name,
                arguments_json = excluded.arguments_json,
                token = excluded.token,
                created_at = excluded.created_at",
        )
        .bind(&session_id.0)
        .bind(&action.tool_name)
        .bind(arguments_json)
        .bind(&action.token)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_pending_action(&self, session_id: &SessionId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM pending_action WHERE session_id = ?")
            .bind(&session_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use leadline_core::domain::memory::{EntityAction, EntityMemory, PendingAction};
    use leadline_core::domain::session::SessionId;

    use crate::repositories::{ConversationMemoryRepository, SqlConversationMemoryRepository};
    use crate::{connect_with_settings, migrations};

    async fn repo_fixture() -> SqlConversationMemoryRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        SqlConversationMemoryRepository::new(pool)
    }

    #[tokio::test]
    async fn entity_memory_is_a_single_overwritten_slot() {
        let repo = repo_fixture().await;
        let session = SessionId("s-1".to_string());

        repo.save_entity_memory(
            &session,
            EntityMemory::new("lead", "42", EntityAction::Create).with_name("Asha"),
        )
        .await
        .expect("save");
        repo.save_entity_memory(&session, EntityMemory::new("task", "7", EntityAction::Update))
            .await
            .expect("overwrite");

        let memory = repo.entity_memory(&session).await.expect("load").expect("present");
        assert_eq!(memory.entity_type, "task");
        assert_eq!(memory.entity_id, "7");
        assert_eq!(memory.entity_name, None, "older slot content must not leak through");

        repo.clear_entity_memory(&session).await.expect("clear");
        assert!(repo.entity_memory(&session).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn pending_action_round_trips_with_token() {
        let repo = repo_fixture().await;
        let session = SessionId("s-1".to_string());
        let action = PendingAction::new("delete_lead", json!({"lead_id": "42"}));
        let token = action.token.clone();

        repo.save_pending_action(&session, action).await.expect("save");

        let loaded = repo.pending_action(&session).await.expect("load").expect("present");
        assert_eq!(loaded.tool_name, "delete_lead");
        assert_eq!(loaded.arguments, json!({"lead_id": "42"}));
        assert_eq!(loaded.token, token);

        repo.clear_pending_action(&session).await.expect("clear");
        assert!(repo.pending_action(&session).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn sessions_do_not_share_memory() {
        let repo = repo_fixture().await;
        let first = SessionId("s-1".to_string());
        let second = SessionId("s-2".to_string());

        repo.save_entity_memory(&first, EntityMemory::new("lead", "42", EntityAction::Create))
            .await
            .expect("save");

        assert!(repo.entity_memory(&second).await.expect("load").is_none());
    }
}

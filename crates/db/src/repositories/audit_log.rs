use chrono::Utc;
use serde_json::Value;

use leadline_core::domain::session::{AdminId, SessionId};

use super::{AuditLogRepository, RepositoryError};
use crate::DbPool;

pub struct SqlAuditLogRepository {
    pool: DbPool,
}

impl SqlAuditLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AuditLogRepository for SqlAuditLogRepository {
    async fn log_action(
        &self,
        session_id: Option<&SessionId>,
        admin_id: &AdminId,
        action: &str,
        details: Value,
    ) -> Result<(), RepositoryError> {
        let details_json = serde_json::to_string(&details)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO audit_log (session_id, admin_id, action, details_json, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id.map(|id| id.0.as_str()))
        .bind(&admin_id.0)
        .bind(action)
        .bind(details_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::Row;

    use leadline_core::domain::session::{AdminId, SessionId};

    use crate::repositories::{AuditLogRepository, SqlAuditLogRepository};
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn actions_are_appended_with_details() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let repo = SqlAuditLogRepository::new(pool.clone());

        let session = SessionId("s-1".to_string());
        repo.log_action(
            Some(&session),
            &AdminId::anonymous(),
            "tool_executed_delete_lead",
            json!({"tool_name": "delete_lead", "result_id": "42"}),
        )
        .await
        .expect("log");

        let row = sqlx::query("SELECT action, details_json, session_id FROM audit_log")
            .fetch_one(&pool)
            .await
            .expect("row");
        assert_eq!(row.get::<String, _>("action"), "tool_executed_delete_lead");
        assert!(row.get::<String, _>("details_json").contains("delete_lead"));
        assert_eq!(row.get::<Option<String>, _>("session_id").as_deref(), Some("s-1"));
    }
}

use chrono::{DateTime, Utc};
use sqlx::Row;

use leadline_core::domain::session::{AdminId, SessionId, SessionRecord, SessionStatus};

use super::{RepositoryError, SessionRepository};
use crate::DbPool;

pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait::async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn find(&self, id: &SessionId) -> Result<Option<SessionRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT session_id, admin_id, status, created_at, last_activity_at
             FROM admin_sessions WHERE session_id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status = SessionStatus::parse(&row.get::<String, _>("status")).ok_or_else(|| {
            RepositoryError::Decode(format!(
                "unknown session status for `{}`",
                row.get::<String, _>("session_id")
            ))
        })?;

        Ok(Some(SessionRecord {
            session_id: SessionId(row.get::<String, _>("session_id")),
            admin_id: AdminId(row.get::<String, _>("admin_id")),
            status,
            created_at: parse_timestamp(&row.get::<String, _>("created_at")),
            last_activity_at: parse_timestamp(&row.get::<String, _>("last_activity_at")),
        }))
    }

    async fn create(&self, record: SessionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO admin_sessions (session_id, admin_id, status, created_at, last_activity_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.session_id.0)
        .bind(&record.admin_id.0)
        .bind(record.status.as_str())
        .bind(record.created_at.to_rfc3339())
        .bind(record.last_activity_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch(&self, id: &SessionId) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE admin_sessions SET last_activity_at = ? WHERE session_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use leadline_core::domain::session::{SessionRecord, SessionStatus};

    use crate::repositories::{SessionRepository, SqlSessionRepository};
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn create_find_touch_round_trip() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let repo = SqlSessionRepository::new(pool);

        let record = SessionRecord::anonymous();
        repo.create(record.clone()).await.expect("create");

        let found = repo.find(&record.session_id).await.expect("find").expect("present");
        assert_eq!(found.session_id, record.session_id);
        assert_eq!(found.status, SessionStatus::Active);

        repo.touch(&record.session_id).await.expect("touch");
        let touched = repo.find(&record.session_id).await.expect("find").expect("present");
        assert!(touched.last_activity_at >= found.last_activity_at);
    }
}

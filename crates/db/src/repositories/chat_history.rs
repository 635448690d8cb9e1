use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sqlx::Row;

use leadline_core::domain::history::ChatTurn;
use leadline_core::domain::session::{AdminId, SessionId};
use leadline_core::domain::turn::SourceType;

use super::{ChatHistoryRepository, RepositoryError};
use crate::DbPool;

/// Read-through cache entry for one (session, limit) key. Staleness up to
/// the TTL is acceptable; correctness-critical state (entity memory,
/// pending actions) never goes through this cache.
struct CacheEntry {
    stored_at: Instant,
    turns: Vec<ChatTurn>,
}

pub struct SqlChatHistoryRepository {
    pool: DbPool,
    cache: Option<Mutex<HashMap<(String, u32), CacheEntry>>>,
    cache_ttl: Duration,
}

impl SqlChatHistoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, cache: None, cache_ttl: Duration::from_secs(120) }
    }

    pub fn with_cache(pool: DbPool, ttl: Duration) -> Self {
        Self { pool, cache: Some(Mutex::new(HashMap::new())), cache_ttl: ttl }
    }

    fn cache_get(&self, key: &(String, u32)) -> Option<Vec<ChatTurn>> {
        let cache = self.cache.as_ref()?;
        let guard = cache.lock().ok()?;
        let entry = guard.get(key)?;
        (entry.stored_at.elapsed() < self.cache_ttl).then(|| entry.turns.clone())
    }

    fn cache_put(&self, key: (String, u32), turns: &[ChatTurn]) {
        // Empty results are not cached so a brand-new session sees its
        // first turn immediately.
        if turns.is_empty() {
            return;
        }
        if let Some(cache) = self.cache.as_ref() {
            if let Ok(mut guard) = cache.lock() {
                guard.insert(key, CacheEntry { stored_at: Instant::now(), turns: turns.to_vec() });
            }
        }
    }
}

fn parse_created_at(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait::async_trait]
impl ChatHistoryRepository for SqlChatHistoryRepository {
    async fn recent_turns(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<ChatTurn>, RepositoryError> {
        let key = (session_id.0.clone(), limit);
        if let Some(cached) = self.cache_get(&key) {
            return Ok(cached);
        }

        let rows = sqlx::query(
            "SELECT id, session_id, admin_id, user_message, assistant_response, source_type, \
                    response_time_ms, tokens_used, created_at
             FROM chat_history
             WHERE session_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?",
        )
        .bind(&session_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        // Rows come back newest first; reverse into chronological order.
        let mut turns: Vec<ChatTurn> = rows
            .into_iter()
            .map(|row| ChatTurn {
                id: Some(row.get::<i64, _>("id")),
                session_id: SessionId(row.get::<String, _>("session_id")),
                admin_id: AdminId(row.get::<String, _>("admin_id")),
                user_message: row.get::<String, _>("user_message"),
                assistant_response: row.get::<String, _>("assistant_response"),
                source_type: row
                    .get::<Option<String>, _>("source_type")
                    .as_deref()
                    .and_then(SourceType::parse),
                response_time_ms: row.get::<Option<i64>, _>("response_time_ms"),
                tokens_used: row.get::<Option<i64>, _>("tokens_used"),
                created_at: parse_created_at(&row.get::<String, _>("created_at")),
            })
            .collect();
        turns.reverse();

        self.cache_put(key, &turns);
        Ok(turns)
    }

    async fn save_turn(&self, turn: ChatTurn) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO chat_history (session_id, admin_id, user_message, assistant_response, \
                                       source_type, response_time_ms, tokens_used, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&turn.session_id.0)
        .bind(&turn.admin_id.0)
        .bind(&turn.user_message)
        .bind(&turn.assistant_response)
        .bind(turn.source_type.map(|source| source.as_str()))
        .bind(turn.response_time_ms)
        .bind(turn.tokens_used)
        .bind(turn.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_turns(&self, session_id: &SessionId) -> Result<i64, RepositoryError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM chat_history WHERE session_id = ?",
        )
        .bind(&session_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use leadline_core::domain::history::ChatTurn;
    use leadline_core::domain::session::{AdminId, SessionId};
    use leadline_core::domain::turn::SourceType;

    use crate::repositories::{ChatHistoryRepository, SqlChatHistoryRepository};
    use crate::{connect_with_settings, migrations};

    async fn pool_fixture() -> crate::DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        pool
    }

    fn turn_fixture(session: &SessionId, user: &str, assistant: &str) -> ChatTurn {
        ChatTurn {
            id: None,
            session_id: session.clone(),
            admin_id: AdminId::anonymous(),
            user_message: user.to_string(),
            assistant_response: assistant.to_string(),
            source_type: Some(SourceType::Crm),
            response_time_ms: Some(20),
            tokens_used: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn turns_come_back_chronological_and_limited() {
        let repo = SqlChatHistoryRepository::new(pool_fixture().await);
        let session = SessionId("s-1".to_string());

        for index in 0..4 {
            repo.save_turn(turn_fixture(&session, &format!("q{index}"), &format!("a{index}")))
                .await
                .expect("save");
        }

        let turns = repo.recent_turns(&session, 3).await.expect("load");
        let questions: Vec<&str> = turns.iter().map(|turn| turn.user_message.as_str()).collect();
        assert_eq!(questions, vec!["q1", "q2", "q3"], "latest 3, oldest first");

        assert_eq!(repo.count_turns(&session).await.expect("count"), 4);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let repo = SqlChatHistoryRepository::new(pool_fixture().await);
        let first = SessionId("s-1".to_string());
        let second = SessionId("s-2".to_string());

        repo.save_turn(turn_fixture(&first, "hello", "hi")).await.expect("save");

        assert!(repo.recent_turns(&second, 10).await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn cached_reads_may_be_stale_until_ttl() {
        let repo =
            SqlChatHistoryRepository::with_cache(pool_fixture().await, Duration::from_secs(60));
        let session = SessionId("s-1".to_string());

        repo.save_turn(turn_fixture(&session, "first", "one")).await.expect("save");
        let initial = repo.recent_turns(&session, 10).await.expect("load");
        assert_eq!(initial.len(), 1);

        repo.save_turn(turn_fixture(&session, "second", "two")).await.expect("save");
        let cached = repo.recent_turns(&session, 10).await.expect("load");
        assert_eq!(cached.len(), 1, "within the TTL the cached read wins");
    }
}

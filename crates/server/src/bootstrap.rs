use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use leadline_agent::email::{DisabledEmailTransport, EmailError};
use leadline_agent::llm::CompletionError;
use leadline_agent::runtime::{ConversationRuntime, RuntimeOptions};
use leadline_agent::{EmailTransport, HttpCompletionClient, SmtpEmailTransport, ToolRegistry};
use leadline_core::config::{AppConfig, ConfigError, LoadOptions};
use leadline_db::repositories::{
    ChatHistoryRepository, SessionRepository, SqlAuditLogRepository, SqlChatHistoryRepository,
    SqlConversationMemoryRepository, SqlCrmRepository, SqlSessionRepository,
};
use leadline_db::{connect_with_settings, migrations, DbPool};

use crate::chat::ChatState;
use crate::rate_limit::RateLimiter;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<ConversationRuntime>,
    pub sessions: Arc<dyn SessionRepository>,
    pub history: Arc<dyn ChatHistoryRepository>,
}

impl Application {
    pub fn chat_state(&self) -> ChatState {
        let rate_limiter = self
            .config
            .runtime
            .rate_limit_enabled
            .then(|| Arc::new(RateLimiter::new(self.config.runtime.rate_limit_per_minute)));
        ChatState::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.sessions),
            Arc::clone(&self.history),
            rate_limiter,
        )
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("completion client setup failed: {0}")]
    Completion(#[source] CompletionError),
    #[error("email transport setup failed: {0}")]
    Email(#[source] EmailError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let history: Arc<dyn ChatHistoryRepository> = if config.runtime.caching_enabled {
        Arc::new(SqlChatHistoryRepository::with_cache(
            db_pool.clone(),
            Duration::from_secs(config.runtime.cache_ttl_secs),
        ))
    } else {
        Arc::new(SqlChatHistoryRepository::new(db_pool.clone()))
    };
    let memory = Arc::new(SqlConversationMemoryRepository::new(db_pool.clone()));
    let crm = Arc::new(SqlCrmRepository::new(db_pool.clone()));
    let audit = Arc::new(SqlAuditLogRepository::new(db_pool.clone()));
    let sessions: Arc<dyn SessionRepository> = Arc::new(SqlSessionRepository::new(db_pool.clone()));

    let completion = Arc::new(
        HttpCompletionClient::from_config(&config.llm).map_err(BootstrapError::Completion)?,
    );

    let email: Arc<dyn EmailTransport> = if config.email.enabled {
        Arc::new(SmtpEmailTransport::from_config(&config.email).map_err(BootstrapError::Email)?)
    } else {
        Arc::new(DisabledEmailTransport)
    };

    let options = RuntimeOptions::from_config(&config.runtime, config.email.from_address.clone());
    let runtime = Arc::new(ConversationRuntime::new(
        Arc::clone(&history),
        memory,
        crm,
        audit,
        completion,
        email,
        ToolRegistry::standard(),
        options,
    ));
    info!(event_name = "system.bootstrap.runtime_ready", "conversation runtime assembled");

    Ok(Application { config, db_pool, runtime, sessions, history })
}

#[cfg(test)]
mod tests {
    use leadline_core::config::{ConfigOverrides, LoadOptions};
    use leadline_core::domain::session::SessionRecord;
    use leadline_db::fixtures::seed_demo_data;
    use leadline_db::repositories::{ChatHistoryRepository, SessionRepository, SqlCrmRepository};

    use crate::bootstrap::bootstrap;

    fn memory_overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations() {
        let app = bootstrap(memory_overrides("sqlite::memory:?cache=shared"))
            .await
            .expect("bootstrap should succeed with an in-memory database");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN \
             ('admin_sessions', 'chat_history', 'entity_memory', 'pending_action', 'leads')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected baseline tables after bootstrap");
        assert_eq!(table_count, 5, "bootstrap should expose the chat and CRM tables");

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn integration_smoke_covers_startup_and_deterministic_turns() {
        let app = bootstrap(memory_overrides("sqlite::memory:?cache=shared"))
            .await
            .expect("bootstrap should succeed");
        seed_demo_data(&SqlCrmRepository::new(app.db_pool.clone())).await.expect("seed");

        let session = SessionRecord::anonymous();
        app.sessions.create(session.clone()).await.expect("session create");

        // Greetings are answered from the fixed text, so this exercises the
        // full runtime wiring without reaching the completion endpoint.
        let response = app.runtime.process_message(&session, "hello").await;
        assert!(!response.is_empty());

        // The follow-up route formats straight from the record store; the
        // seeded lead with an overdue follow-up date must show up.
        let response = app.runtime.process_message(&session, "show pending leads").await;
        assert!(response.contains("Asha Rao"), "unexpected follow-up reply: {response}");

        let turns =
            app.history.recent_turns(&session.session_id, 10).await.expect("history read");
        assert_eq!(turns.len(), 2, "both turns should be persisted");
        assert_eq!(turns[0].user_message, "hello");

        app.db_pool.close().await;
    }
}

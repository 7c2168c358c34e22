use std::sync::Arc;
use std::time::Duration;

use parley_agent::{
    llm::provider_from_config, responder_from_config, ActorEnvironment, ActorRegistry,
    ActorSettings, LlmError, ToolRegistry, TokioWakeScheduler, TracingChatSink,
};
use parley_core::audit::TracingAuditSink;
use parley_core::config::{AppConfig, ConfigError, LoadOptions};
use parley_db::connection::connect_with_config;
use parley_db::{migrations, DbPool, RepositoryError, SqlConversationStore};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub registry: Arc<ActorRegistry>,
    dispatcher: JoinHandle<()>,
}

impl Application {
    /// Stops the wake-up dispatcher and closes the pool, waiting at most `grace`.
    pub async fn shutdown(self, grace: Duration) {
        self.dispatcher.abort();
        if tokio::time::timeout(grace, self.db_pool.close()).await.is_err() {
            warn!(
                event_name = "system.shutdown.pool_close_timeout",
                correlation_id = "shutdown",
                "database pool did not close within the grace period"
            );
        }
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
    #[error("llm provider setup failed: {0}")]
    Provider(#[from] LlmError),
    #[error("pending conversation recovery failed: {0}")]
    Recovery(#[source] RepositoryError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let llm = provider_from_config(&config.llm)?;
    let sink = Arc::new(TracingChatSink);
    let tools = ToolRegistry::with_builtin_tools();
    info!(
        event_name = "system.bootstrap.tools_registered",
        correlation_id = "bootstrap",
        llm_provider = llm.name(),
        tools = ?tools.names(),
        "llm provider and tools ready"
    );

    let responder = responder_from_config(&config, llm, Arc::new(tools), sink.clone());

    let (scheduler, fired) = TokioWakeScheduler::new();
    let registry = Arc::new(ActorRegistry::new(Arc::new(ActorEnvironment {
        store: Arc::new(SqlConversationStore::new(db_pool.clone())),
        scheduler: Arc::new(scheduler),
        responder: Arc::new(responder),
        sink,
        audit: Arc::new(TracingAuditSink),
        settings: ActorSettings::from_config(&config),
    })));
    let dispatcher = Arc::clone(&registry).run_wakeups(fired);

    let recovered = registry.recover_pending().await.map_err(BootstrapError::Recovery)?;
    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        recovered_conversations = recovered,
        "application bootstrap complete"
    );

    Ok(Application { config, db_pool, registry, dispatcher })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_core::config::{ConfigOverrides, LoadOptions};
    use parley_core::domain::conversation::ConversationKey;
    use parley_core::domain::io::ParsedInput;

    use crate::bootstrap::{bootstrap, BootstrapError};

    fn overrides(database_url: &str, llm_provider: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                llm_provider: Some(llm_provider.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_unknown_llm_provider() {
        let result = bootstrap(overrides("sqlite::memory:", "carrier-pigeon")).await;

        let error = result.err().expect("bootstrap should fail");
        assert!(matches!(error, BootstrapError::Provider(_)));
        assert!(error.to_string().contains("carrier-pigeon"));
    }

    #[tokio::test]
    async fn bootstrapped_application_answers_messages_end_to_end() {
        let app = bootstrap(overrides("sqlite::memory:", "loopback"))
            .await
            .expect("bootstrap should succeed with the loopback provider");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name = 'conversation_actor_state'",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("conversation table should exist after bootstrap");
        assert_eq!(table_count, 1);

        let key = ConversationKey::for_chat("web", "smoke");
        app.registry
            .receive(&key, ParsedInput::new("ping", "user-1", "smoke").with_platform("web"))
            .await
            .expect("receive");

        let mut history = Vec::new();
        for _ in 0..200 {
            history = app.registry.history(&key).await.expect("history");
            if history.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "You said: ping");

        app.shutdown(Duration::from_secs(1)).await;
    }
}

use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use cbag_agent::{AgentRuntime, GeminiClient, InputPolicy, LlmError, RetrievalTool, ToolRegistry};
use cbag_core::config::{AppConfig, SessionStoreKind};
use cbag_core::prompt::{PromptError, SystemPrompt};
use cbag_db::{
    connect_with_config, migrations, InMemorySessionRepository, SessionRepository,
    SqlSessionRepository,
};

use crate::{health, webhook, webhook::AppState};

pub struct Application {
    pub config: AppConfig,
    pub state: AppState,
}

impl Application {
    pub fn router(&self) -> Router {
        webhook::router(self.state.clone())
            .merge(health::router(self.state.sessions.clone()))
            .layer(TraceLayer::new_for_http())
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("chat model client setup failed: {0}")]
    Llm(#[from] LlmError),
    #[error("retrieval client setup failed: {0}")]
    Retrieval(#[source] reqwest::Error),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        session_store = ?config.sessions.store,
        model = %config.llm.model,
        "starting application bootstrap"
    );

    let sessions = session_store(&config).await?;
    let system_prompt = SystemPrompt::load(config.agent.system_prompt_path.as_deref())?;

    let llm = GeminiClient::from_config(&config.llm)?;
    let mut tools = ToolRegistry::default();
    tools.register(RetrievalTool::from_config(&config.retrieval).map_err(BootstrapError::Retrieval)?);
    if !config.retrieval_configured() {
        warn!(
            event_name = "system.bootstrap.retrieval_unconfigured",
            correlation_id = "bootstrap",
            "retrieval api key missing; knowledge base lookups will report an error to the model"
        );
    }

    let runtime =
        AgentRuntime::new(Arc::new(llm), tools).with_max_tool_rounds(config.agent.max_tool_rounds);
    let state = AppState::new(
        sessions,
        Arc::new(runtime),
        system_prompt,
        InputPolicy::new(config.agent.max_input_chars),
    );

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        tools = ?state.runtime.tools().names(),
        "application bootstrap finished"
    );

    Ok(Application { config, state })
}

async fn session_store(config: &AppConfig) -> Result<Arc<dyn SessionRepository>, BootstrapError> {
    match config.sessions.store {
        SessionStoreKind::Memory => Ok(Arc::new(InMemorySessionRepository::default())),
        SessionStoreKind::Sqlite => {
            let pool = connect_with_config(&config.database)
                .await
                .map_err(BootstrapError::DatabaseConnect)?;
            info!(
                event_name = "system.bootstrap.database_connected",
                correlation_id = "bootstrap",
                "database connection established"
            );

            migrations::run_pending(&pool).await.map_err(BootstrapError::Migration)?;
            info!(
                event_name = "system.bootstrap.migrations_applied",
                correlation_id = "bootstrap",
                "database migrations applied"
            );

            Ok(Arc::new(SqlSessionRepository::new(pool)))
        }
    }
}

use chrono::Utc;
use tracing::debug;

use cbag_core::domain::message::{Message, SessionId};

use super::{RepositoryError, SessionRepository};
use crate::DbPool;

/// Stores each session's history as one JSON document per row.
pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn load(&self, id: &SessionId) -> Result<Option<Vec<Message>>, RepositoryError> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT messages_json FROM conversation_session WHERE session_id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        raw.map(|json| {
            serde_json::from_str::<Vec<Message>>(&json).map_err(|error| {
                RepositoryError::Decode(format!("session `{id}` history is not valid: {error}"))
            })
        })
        .transpose()
    }

    async fn save(&self, id: &SessionId, messages: &[Message]) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(messages)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO conversation_session \
                 (session_id, messages_json, message_count, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(session_id) DO UPDATE SET \
                 messages_json = excluded.messages_json, \
                 message_count = excluded.message_count, \
                 updated_at = excluded.updated_at",
        )
        .bind(id.as_str())
        .bind(json)
        .bind(messages.len() as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        debug!(
            event_name = "db.session.saved",
            session_id = %id,
            message_count = messages.len(),
            "session history persisted"
        );
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM conversation_session WHERE session_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn health(&self) -> Result<(), RepositoryError> {
        sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

use async_trait::async_trait;
use thiserror::Error;

use cbag_core::domain::message::{Message, SessionId};
use cbag_core::errors::ApplicationError;

pub mod memory;
pub mod session;

pub use memory::InMemorySessionRepository;
pub use session::SqlSessionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        Self::Persistence(value.to_string())
    }
}

/// Conversation histories keyed by session id.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// `None` means the session has never completed a turn.
    async fn load(&self, id: &SessionId) -> Result<Option<Vec<Message>>, RepositoryError>;
    async fn save(&self, id: &SessionId, messages: &[Message]) -> Result<(), RepositoryError>;
    async fn delete(&self, id: &SessionId) -> Result<bool, RepositoryError>;
    async fn health(&self) -> Result<(), RepositoryError>;
    fn backend(&self) -> &'static str;
}

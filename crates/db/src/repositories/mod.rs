use async_trait::async_trait;
use thiserror::Error;

use parley_core::domain::conversation::{ConversationActorState, ConversationKey};

pub mod conversation;
pub mod memory;

pub use conversation::SqlConversationStore;
pub use memory::InMemoryConversationStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable per-conversation state. Writes are last-write-wins per key.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationActorState>, RepositoryError>;

    async fn put(
        &self,
        key: &ConversationKey,
        state: ConversationActorState,
    ) -> Result<(), RepositoryError>;

    /// Conversations holding a pending or active context, used to re-arm
    /// wake-ups after a restart.
    async fn pending_keys(&self) -> Result<Vec<ConversationKey>, RepositoryError>;
}

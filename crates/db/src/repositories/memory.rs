use std::collections::HashMap;

use tokio::sync::RwLock;

use parley_core::domain::conversation::{ConversationActorState, ConversationKey};

use super::{ConversationStore, RepositoryError};

#[derive(Default)]
pub struct InMemoryConversationStore {
    states: RwLock<HashMap<String, ConversationActorState>>,
}

impl InMemoryConversationStore {
    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationActorState>, RepositoryError> {
        let states = self.states.read().await;
        Ok(states.get(key.as_str()).cloned())
    }

    async fn put(
        &self,
        key: &ConversationKey,
        state: ConversationActorState,
    ) -> Result<(), RepositoryError> {
        let mut states = self.states.write().await;
        states.insert(key.as_str().to_string(), state);
        Ok(())
    }

    async fn pending_keys(&self) -> Result<Vec<ConversationKey>, RepositoryError> {
        let states = self.states.read().await;
        let mut keys: Vec<ConversationKey> = states
            .iter()
            .filter(|(_, state)| !state.is_idle())
            .map(|(key, _)| ConversationKey::new(key.clone()))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use parley_core::domain::conversation::{
        ChatMessage, ConversationActorState, ConversationKey,
    };

    use crate::repositories::{ConversationStore, InMemoryConversationStore};

    #[tokio::test]
    async fn in_memory_store_round_trip() {
        let store = InMemoryConversationStore::default();
        let key = ConversationKey::for_chat("web", "chat-1");
        let mut state = ConversationActorState::new("web:chat-1", Utc::now());
        state.push_message(ChatMessage::user("hello"), 10);

        assert_eq!(store.get(&key).await.expect("get"), None);
        store.put(&key, state.clone()).await.expect("put");

        assert_eq!(store.get(&key).await.expect("get"), Some(state));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn idle_conversations_are_not_pending() {
        let store = InMemoryConversationStore::default();
        let key = ConversationKey::for_chat("web", "idle");
        store
            .put(&key, ConversationActorState::new("web:idle", Utc::now()))
            .await
            .expect("put");

        assert!(store.pending_keys().await.expect("pending keys").is_empty());
    }
}

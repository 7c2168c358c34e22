use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::domain::conversation::{ConversationActorState, ConversationKey};

use super::{ConversationStore, RepositoryError};
use crate::DbPool;

pub struct SqlConversationStore {
    pool: DbPool,
}

impl SqlConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationStore for SqlConversationStore {
    async fn get(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationActorState>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                conversation_key,
                state_json,
                state_version,
                created_at,
                updated_at
             FROM conversation_actor_state
             WHERE conversation_key = ?",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(state_from_row).transpose()
    }

    async fn put(
        &self,
        key: &ConversationKey,
        state: ConversationActorState,
    ) -> Result<(), RepositoryError> {
        let state_json = serde_json::to_string(&state)?;
        let state_version = i64::try_from(state.version).map_err(|_| {
            RepositoryError::Decode(format!("state_version {} overflows i64", state.version))
        })?;

        sqlx::query(
            "INSERT INTO conversation_actor_state (
                conversation_key,
                state_json,
                has_pending,
                has_active,
                state_version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(conversation_key) DO UPDATE SET
                state_json = excluded.state_json,
                has_pending = excluded.has_pending,
                has_active = excluded.has_active,
                state_version = excluded.state_version,
                updated_at = excluded.updated_at",
        )
        .bind(key.as_str())
        .bind(state_json)
        .bind(state.pending_context.is_some())
        .bind(state.active_context.is_some())
        .bind(state_version)
        .bind(state.created_at.to_rfc3339())
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_keys(&self) -> Result<Vec<ConversationKey>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT conversation_key
             FROM conversation_actor_state
             WHERE has_pending = 1 OR has_active = 1
             ORDER BY conversation_key ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(ConversationKey::new(row.try_get::<String, _>("conversation_key")?)))
            .collect()
    }
}

fn state_from_row(row: SqliteRow) -> Result<ConversationActorState, RepositoryError> {
    let key: String = row.try_get("conversation_key")?;
    let state_json: String = row.try_get("state_json")?;
    let state: ConversationActorState = serde_json::from_str(&state_json).map_err(|error| {
        RepositoryError::Decode(format!("invalid state_json for `{key}`: {error}"))
    })?;

    let column_version: i64 = row.try_get("state_version")?;
    if u64::try_from(column_version).ok() != Some(state.version) {
        return Err(RepositoryError::Decode(format!(
            "state_version column ({column_version}) disagrees with stored state ({}) for `{key}`",
            state.version
        )));
    }

    // Timestamps are kept as columns for operators; the JSON copy is authoritative.
    parse_timestamp("created_at", row.try_get("created_at")?)?;
    parse_timestamp("updated_at", row.try_get("updated_at")?)?;

    Ok(state)
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|parsed| parsed.with_timezone(&Utc)).map_err(
        |error| RepositoryError::Decode(format!("invalid timestamp in `{column}`: {error}")),
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use parley_core::domain::conversation::{
        ChatMessage, ConversationActorState, ConversationKey,
    };

    use super::SqlConversationStore;
    use crate::repositories::ConversationStore;
    use crate::{connect_with_settings, migrations};

    async fn store() -> SqlConversationStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlConversationStore::new(pool)
    }

    #[tokio::test]
    async fn sql_store_round_trip_and_overwrite() {
        let store = store().await;
        let key = ConversationKey::for_chat("web", "chat-9");
        let mut state = ConversationActorState::new("web:chat-9", Utc::now());
        state.push_message(ChatMessage::user("first"), 10);
        state.touch(Utc::now());

        store.put(&key, state.clone()).await.expect("put");
        assert_eq!(store.get(&key).await.expect("get"), Some(state.clone()));

        state.push_message(ChatMessage::assistant("second"), 10);
        state.touch(Utc::now());
        store.put(&key, state.clone()).await.expect("overwrite");

        let loaded = store.get(&key).await.expect("get").expect("state present");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let store = store().await;
        let missing = store.get(&ConversationKey::new("nope")).await.expect("get");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn idle_state_is_not_reported_pending() {
        let store = store().await;
        let key = ConversationKey::new("web:idle");
        store.put(&key, ConversationActorState::new("web:idle", Utc::now())).await.expect("put");

        assert!(store.pending_keys().await.expect("pending").is_empty());
    }
}

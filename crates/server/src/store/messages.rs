// Chat message store.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use cinesync_common::types::{ChatMessage, MessageKind};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
}

#[derive(Clone)]
pub enum MessageStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<Uuid, Vec<ChatMessage>>>>),
}

impl MessageStore {
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    pub async fn create(&self, new_message: NewChatMessage) -> Result<ChatMessage> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO messages (id, room_id, user_id, content, kind)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING *
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(new_message.room_id)
                .bind(new_message.user_id)
                .bind(&new_message.content)
                .bind(new_message.kind.as_str())
                .fetch_one(pool)
                .await
                .context("failed to insert chat message")?;

                message_from_row(&row)
            }
            Self::Memory(store) => {
                let message = ChatMessage {
                    id: Uuid::new_v4(),
                    room_id: new_message.room_id,
                    user_id: new_message.user_id,
                    content: new_message.content,
                    kind: new_message.kind,
                    created_at: Utc::now(),
                };
                store.write().await.entry(message.room_id).or_default().push(message.clone());
                Ok(message)
            }
        }
    }

    /// The room's most recent messages, oldest first.
    pub async fn recent(&self, room_id: Uuid, limit: i64) -> Result<Vec<ChatMessage>> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query(
                    r#"
                    SELECT * FROM messages
                    WHERE room_id = $1
                    ORDER BY created_at DESC
                    LIMIT $2
                    "#,
                )
                .bind(room_id)
                .bind(limit)
                .fetch_all(pool)
                .await
                .context("failed to fetch recent chat messages")?;

                let mut messages = rows
                    .iter()
                    .map(message_from_row)
                    .collect::<Result<Vec<_>>>()?;
                messages.reverse();
                Ok(messages)
            }
            Self::Memory(store) => {
                let guard = store.read().await;
                let Some(messages) = guard.get(&room_id) else {
                    return Ok(Vec::new());
                };
                let skip = messages.len().saturating_sub(limit.max(0) as usize);
                Ok(messages[skip..].to_vec())
            }
        }
    }
}

fn message_from_row(row: &PgRow) -> Result<ChatMessage> {
    let kind: String = row.try_get("kind").context("missing kind")?;
    Ok(ChatMessage {
        id: row.try_get("id").context("missing id")?,
        room_id: row.try_get("room_id").context("missing room_id")?,
        user_id: row.try_get("user_id").context("missing user_id")?,
        content: row.try_get("content").context("missing content")?,
        kind: kind.parse().with_context(|| format!("message has invalid kind '{kind}'"))?,
        created_at: row.try_get("created_at").context("missing created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::{MessageStore, NewChatMessage};
    use cinesync_common::types::MessageKind;
    use uuid::Uuid;

    fn text_message(room_id: Uuid, content: &str) -> NewChatMessage {
        NewChatMessage {
            room_id,
            user_id: Uuid::new_v4(),
            content: content.to_string(),
            kind: MessageKind::Text,
        }
    }

    #[tokio::test]
    async fn create_assigns_id_and_timestamp() {
        let store = MessageStore::for_tests();
        let room_id = Uuid::new_v4();
        let message = store.create(text_message(room_id, "hello")).await.unwrap();

        assert_eq!(message.room_id, room_id);
        assert_eq!(message.content, "hello");
        assert_eq!(message.kind, MessageKind::Text);
    }

    #[tokio::test]
    async fn recent_returns_oldest_first_capped_at_limit() {
        let store = MessageStore::for_tests();
        let room_id = Uuid::new_v4();
        for index in 0..5 {
            store.create(text_message(room_id, &format!("m{index}"))).await.unwrap();
        }

        let recent = store.recent(room_id, 3).await.unwrap();
        let contents: Vec<&str> =
            recent.iter().map(|message| message.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn recent_is_scoped_per_room() {
        let store = MessageStore::for_tests();
        let (room_a, room_b) = (Uuid::new_v4(), Uuid::new_v4());
        store.create(text_message(room_a, "a")).await.unwrap();
        store.create(text_message(room_b, "b")).await.unwrap();

        let recent = store.recent(room_a, 50).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "a");
    }

    #[tokio::test]
    async fn recent_on_empty_room_is_empty() {
        let store = MessageStore::for_tests();
        assert!(store.recent(Uuid::new_v4(), 50).await.unwrap().is_empty());
    }
}

// Message relay: validate, persist, enrich, broadcast.
//
// System notices (join/leave) are synthesized here with the `system` kind;
// they skip content validation but take the same persist -> enrich ->
// broadcast path as user messages.

use anyhow::{anyhow, Result};
use cinesync_common::protocol::ws::{ServerEvent, MAX_CHAT_MESSAGE_CHARS};
use cinesync_common::types::{EnrichedMessage, MessageKind, UserStat};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ErrorCode, HandlerError};
use crate::metrics;
use crate::store::messages::NewChatMessage;
use crate::store::Stores;
use crate::ws::registry::SessionRegistry;

/// How many messages a joining session receives as history.
pub(crate) const RECENT_HISTORY_LIMIT: i64 = 50;

/// System notices the relay synthesizes on membership changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notice {
    Joined,
    Left,
}

pub(crate) async fn handle_message(
    stores: &Stores,
    registry: &SessionRegistry,
    user_id: Uuid,
    room_id: Uuid,
    content: String,
) -> Result<Vec<ServerEvent>, HandlerError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        // Dropped silently; not worth an error frame.
        return Ok(Vec::new());
    }
    if trimmed.chars().count() > MAX_CHAT_MESSAGE_CHARS {
        return Err(HandlerError::client(ErrorCode::ValidationFailed, "Message too long"));
    }

    let message = stores
        .messages
        .create(NewChatMessage {
            room_id,
            user_id,
            content: trimmed.to_string(),
            kind: MessageKind::Text,
        })
        .await?;

    let Some(user) = stores.users.fetch(user_id).await? else {
        return Err(HandlerError::Internal(anyhow!(
            "author profile missing for user {user_id}"
        )));
    };
    stores.users.increment_stat(user_id, UserStat::MessagesSent).await?;

    let delivered = registry
        .broadcast(room_id, ServerEvent::NewMessage { message: EnrichedMessage { message, user } })
        .await;
    metrics::observe_broadcast(delivered);
    Ok(Vec::new())
}

/// Persist and broadcast a join/leave notice. Skipped when the subject has
/// no profile to name them by.
pub(crate) async fn post_system_notice(
    stores: &Stores,
    registry: &SessionRegistry,
    room_id: Uuid,
    user_id: Uuid,
    notice: Notice,
) -> Result<()> {
    let Some(user) = stores.users.fetch(user_id).await? else {
        warn!(%user_id, %room_id, "no profile for system notice, skipping");
        return Ok(());
    };

    let content = match notice {
        Notice::Joined => format!("{} joined the room", user.display_name),
        Notice::Left => format!("{} left the room", user.display_name),
    };
    let message = stores
        .messages
        .create(NewChatMessage { room_id, user_id, content, kind: MessageKind::System })
        .await?;

    let delivered = registry
        .broadcast(room_id, ServerEvent::NewMessage { message: EnrichedMessage { message, user } })
        .await;
    metrics::observe_broadcast(delivered);
    Ok(())
}

/// The room's recent history as a frame for a joining session, oldest
/// first. Messages whose author profile is gone are skipped.
pub(crate) async fn history_event(stores: &Stores, room_id: Uuid) -> Result<ServerEvent> {
    let recent = stores.messages.recent(room_id, RECENT_HISTORY_LIMIT).await?;
    let mut messages = Vec::with_capacity(recent.len());
    for message in recent {
        match stores.users.fetch(message.user_id).await? {
            Some(user) => messages.push(EnrichedMessage { message, user }),
            None => warn!(user_id = %message.user_id, %room_id, "message author has no profile, skipping"),
        }
    }

    Ok(ServerEvent::ChatHistory { room_id, messages })
}

#[cfg(test)]
mod tests {
    use super::{handle_message, history_event, post_system_notice, Notice};
    use crate::error::HandlerError;
    use crate::store::Stores;
    use crate::ws::registry::SessionRegistry;
    use chrono::Utc;
    use cinesync_common::protocol::ws::ServerEvent;
    use cinesync_common::types::{MessageKind, User, UserStat};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn sample_user(name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: None,
            display_name: name.to_string(),
            avatar_url: None,
            created_at: Utc::now(),
            last_active: Utc::now(),
        }
    }

    struct Fixture {
        stores: Stores,
        registry: SessionRegistry,
        room_id: Uuid,
        author: User,
        room_rx: mpsc::UnboundedReceiver<ServerEvent>,
    }

    async fn fixture() -> Fixture {
        let stores = Stores::memory();
        let registry = SessionRegistry::default();
        let room_id = Uuid::new_v4();
        let author = sample_user("Alice");
        stores.users.insert_for_tests(author.clone()).await;

        let session = Uuid::new_v4();
        registry.create_session(session, author.id).await;
        let (sender, room_rx) = mpsc::unbounded_channel();
        registry.register_outbound(session, sender).await;
        registry.bind_room(session, room_id).await;

        Fixture { stores, registry, room_id, author, room_rx }
    }

    #[tokio::test]
    async fn valid_messages_are_persisted_enriched_and_broadcast() {
        let mut fx = fixture().await;

        handle_message(&fx.stores, &fx.registry, fx.author.id, fx.room_id, "  hello  ".into())
            .await
            .unwrap();

        let ServerEvent::NewMessage { message } = fx.room_rx.recv().await.unwrap() else {
            panic!("expected a new message frame");
        };
        assert_eq!(message.message.content, "hello");
        assert_eq!(message.message.kind, MessageKind::Text);
        assert_eq!(message.user.display_name, "Alice");

        // Persisted with the trimmed content.
        let stored = fx.stores.messages.recent(fx.room_id, 50).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "hello");

        assert_eq!(fx.stores.users.stat_for_tests(fx.author.id, UserStat::MessagesSent).await, 1);
    }

    #[tokio::test]
    async fn blank_content_is_dropped_silently() {
        let mut fx = fixture().await;

        let replies =
            handle_message(&fx.stores, &fx.registry, fx.author.id, fx.room_id, "   \n ".into())
                .await
                .unwrap();

        assert!(replies.is_empty());
        assert!(fx.room_rx.try_recv().is_err());
        assert!(fx.stores.messages.recent(fx.room_id, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversize_content_is_rejected_and_not_persisted() {
        let mut fx = fixture().await;
        let oversize = "x".repeat(1001);

        let result =
            handle_message(&fx.stores, &fx.registry, fx.author.id, fx.room_id, oversize).await;

        let Err(HandlerError::Client(ServerEvent::Error { code, message })) = result else {
            panic!("expected a validation error");
        };
        assert_eq!(code, "VALIDATION_FAILED");
        assert_eq!(message, "Message too long");
        assert!(fx.room_rx.try_recv().is_err());
        assert!(fx.stores.messages.recent(fx.room_id, 50).await.unwrap().is_empty());
        assert_eq!(fx.stores.users.stat_for_tests(fx.author.id, UserStat::MessagesSent).await, 0);
    }

    #[tokio::test]
    async fn exactly_one_thousand_chars_is_accepted() {
        let fx = fixture().await;
        let content = "y".repeat(1000);

        handle_message(&fx.stores, &fx.registry, fx.author.id, fx.room_id, content).await.unwrap();
        assert_eq!(fx.stores.messages.recent(fx.room_id, 50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn system_notices_bypass_validation_and_carry_the_system_kind() {
        let mut fx = fixture().await;

        post_system_notice(&fx.stores, &fx.registry, fx.room_id, fx.author.id, Notice::Joined)
            .await
            .unwrap();

        let ServerEvent::NewMessage { message } = fx.room_rx.recv().await.unwrap() else {
            panic!("expected a new message frame");
        };
        assert_eq!(message.message.kind, MessageKind::System);
        assert_eq!(message.message.content, "Alice joined the room");
        // System notices do not bump the author's counter.
        assert_eq!(fx.stores.users.stat_for_tests(fx.author.id, UserStat::MessagesSent).await, 0);
    }

    #[tokio::test]
    async fn system_notice_without_profile_is_skipped() {
        let mut fx = fixture().await;

        post_system_notice(&fx.stores, &fx.registry, fx.room_id, Uuid::new_v4(), Notice::Left)
            .await
            .unwrap();

        assert!(fx.room_rx.try_recv().is_err());
        assert!(fx.stores.messages.recent(fx.room_id, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_event_returns_enriched_messages_oldest_first() {
        let fx = fixture().await;
        for content in ["first", "second"] {
            handle_message(&fx.stores, &fx.registry, fx.author.id, fx.room_id, content.into())
                .await
                .unwrap();
        }

        let ServerEvent::ChatHistory { room_id, messages } =
            history_event(&fx.stores, fx.room_id).await.unwrap()
        else {
            panic!("expected a chat history frame");
        };
        assert_eq!(room_id, fx.room_id);
        let contents: Vec<&str> =
            messages.iter().map(|m| m.message.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert!(messages.iter().all(|m| m.user.id == fx.author.id));
    }
}

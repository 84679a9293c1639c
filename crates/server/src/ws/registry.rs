// Session registry and room broadcast channel.
//
// Sessions move through connecting -> authenticated -> room-bound ->
// disconnected. A session is bound to at most one room; the room channel
// maps room id -> subscribed session ids and fans server events out over
// each session's outbound queue. Delivery is send-and-forget: a session
// whose queue is gone is skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cinesync_common::protocol::ws::ServerEvent;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<Uuid, SessionRecord>,
    /// Room channel: room id -> sessions subscribed to its broadcasts.
    rooms: HashMap<Uuid, HashSet<Uuid>>,
}

#[derive(Debug)]
struct SessionRecord {
    user_id: Uuid,
    room_id: Option<Uuid>,
    connected_at: DateTime<Utc>,
    outbound: Option<mpsc::UnboundedSender<ServerEvent>>,
}

impl SessionRegistry {
    /// Register a freshly authenticated connection.
    pub async fn create_session(&self, session_id: Uuid, user_id: Uuid) {
        let mut guard = self.inner.write().await;
        guard.sessions.insert(
            session_id,
            SessionRecord { user_id, room_id: None, connected_at: Utc::now(), outbound: None },
        );
    }

    pub async fn register_outbound(
        &self,
        session_id: Uuid,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> bool {
        let mut guard = self.inner.write().await;
        match guard.sessions.get_mut(&session_id) {
            Some(session) => {
                session.outbound = Some(sender);
                true
            }
            None => false,
        }
    }

    pub async fn user_for_session(&self, session_id: Uuid) -> Option<Uuid> {
        self.inner.read().await.sessions.get(&session_id).map(|session| session.user_id)
    }

    pub async fn room_for_session(&self, session_id: Uuid) -> Option<Uuid> {
        self.inner.read().await.sessions.get(&session_id).and_then(|session| session.room_id)
    }

    pub async fn connected_at(&self, session_id: Uuid) -> Option<DateTime<Utc>> {
        self.inner.read().await.sessions.get(&session_id).map(|session| session.connected_at)
    }

    /// Bind the session to `room_id`, subscribing it to the room channel.
    /// Idempotent for an already-bound room. Returns the previous binding
    /// (`None` inner value = was not bound), or `None` if the session is
    /// unknown.
    pub async fn bind_room(&self, session_id: Uuid, room_id: Uuid) -> Option<Option<Uuid>> {
        let mut guard = self.inner.write().await;
        let previous = {
            let session = guard.sessions.get_mut(&session_id)?;
            let previous = session.room_id;
            session.room_id = Some(room_id);
            previous
        };

        if let Some(previous_room) = previous {
            if previous_room != room_id {
                unsubscribe(&mut guard.rooms, previous_room, session_id);
            }
        }
        guard.rooms.entry(room_id).or_default().insert(session_id);

        Some(previous)
    }

    /// Drop the session's room binding. Idempotent; returns the room the
    /// session was bound to, if any.
    pub async fn unbind_room(&self, session_id: Uuid) -> Option<Uuid> {
        let mut guard = self.inner.write().await;
        let room_id = {
            let session = guard.sessions.get_mut(&session_id)?;
            session.room_id.take()?
        };
        unsubscribe(&mut guard.rooms, room_id, session_id);
        Some(room_id)
    }

    /// Remove the session entirely. Returns `(user_id, bound_room)` so the
    /// caller can run leave cleanup after the session is gone from the
    /// channel (it must not receive its own departure broadcast).
    pub async fn remove_session(&self, session_id: Uuid) -> Option<(Uuid, Option<Uuid>)> {
        let mut guard = self.inner.write().await;
        let session = guard.sessions.remove(&session_id)?;
        if let Some(room_id) = session.room_id {
            unsubscribe(&mut guard.rooms, room_id, session_id);
        }
        Some((session.user_id, session.room_id))
    }

    pub async fn subscriber_count(&self, room_id: Uuid) -> usize {
        self.inner.read().await.rooms.get(&room_id).map(HashSet::len).unwrap_or(0)
    }

    /// Deliver an event to every session subscribed to the room. Returns
    /// the number of sessions the event was queued for.
    pub async fn broadcast(&self, room_id: Uuid, event: ServerEvent) -> usize {
        self.fan_out(room_id, event, None).await
    }

    /// Same as [`broadcast`], skipping the originating session.
    pub async fn broadcast_excluding(
        &self,
        room_id: Uuid,
        event: ServerEvent,
        exclude_session: Uuid,
    ) -> usize {
        self.fan_out(room_id, event, Some(exclude_session)).await
    }

    async fn fan_out(
        &self,
        room_id: Uuid,
        event: ServerEvent,
        exclude_session: Option<Uuid>,
    ) -> usize {
        let mut recipients = Vec::new();
        {
            let guard = self.inner.read().await;
            let Some(subscribers) = guard.rooms.get(&room_id) else {
                return 0;
            };
            for session_id in subscribers {
                if Some(*session_id) == exclude_session {
                    continue;
                }
                if let Some(sender) =
                    guard.sessions.get(session_id).and_then(|session| session.outbound.clone())
                {
                    recipients.push(sender);
                }
            }
        }

        let mut sent_count = 0;
        for recipient in recipients {
            if recipient.send(event.clone()).is_ok() {
                sent_count += 1;
            }
        }

        sent_count
    }
}

fn unsubscribe(rooms: &mut HashMap<Uuid, HashSet<Uuid>>, room_id: Uuid, session_id: Uuid) {
    if let Some(subscribers) = rooms.get_mut(&room_id) {
        subscribers.remove(&session_id);
        if subscribers.is_empty() {
            rooms.remove(&room_id);
        }
    }
}

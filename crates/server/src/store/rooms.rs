// Room aggregate store: the persistent side of rooms and their
// participant sets.
//
// Postgres is the production backend; the in-memory variant backs tests
// with the same semantics (idempotent membership insert, join-ordered
// participant listing, partial video-state update).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cinesync_common::types::{Room, VideoPlatform};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Parameters for creating a room. Video fields start empty: no url,
/// `custom` platform, time zero, paused.
#[derive(Debug, Clone)]
pub struct NewRoom {
    pub name: String,
    pub host_id: Uuid,
    pub max_participants: i32,
    pub is_public: bool,
    pub password_hash: Option<String>,
}

/// Partial update of the aggregate's video fields. `None` leaves the
/// column untouched.
#[derive(Debug, Clone, Default)]
pub struct VideoStateUpdate {
    pub video_url: Option<String>,
    pub video_platform: Option<VideoPlatform>,
    pub current_time: Option<f64>,
    pub is_playing: Option<bool>,
}

#[derive(Clone)]
pub enum RoomStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryRooms>>),
}

#[derive(Debug, Default)]
pub struct MemoryRooms {
    rooms: HashMap<Uuid, Room>,
    /// Per room, memberships in join order.
    participants: HashMap<Uuid, Vec<Membership>>,
}

#[derive(Debug, Clone)]
struct Membership {
    user_id: Uuid,
    joined_at: DateTime<Utc>,
}

impl RoomStore {
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryRooms::default())))
    }

    pub async fn create(&self, new_room: NewRoom) -> Result<Room> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO rooms
                        (id, name, host_id, video_url, video_platform, "current_time",
                         is_playing, max_participants, is_public, password_hash)
                    VALUES ($1, $2, $3, NULL, 'custom', 0, FALSE, $4, $5, $6)
                    RETURNING *
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(&new_room.name)
                .bind(new_room.host_id)
                .bind(new_room.max_participants)
                .bind(new_room.is_public)
                .bind(&new_room.password_hash)
                .fetch_one(pool)
                .await
                .context("failed to insert room")?;

                room_from_row(&row)
            }
            Self::Memory(store) => {
                let now = Utc::now();
                let room = Room {
                    id: Uuid::new_v4(),
                    name: new_room.name,
                    host_id: new_room.host_id,
                    video_url: None,
                    video_platform: VideoPlatform::Custom,
                    current_time: 0.0,
                    is_playing: false,
                    max_participants: new_room.max_participants,
                    is_public: new_room.is_public,
                    password_hash: new_room.password_hash,
                    created_at: now,
                    updated_at: now,
                };
                let mut guard = store.write().await;
                guard.rooms.insert(room.id, room.clone());
                guard.participants.entry(room.id).or_default();
                Ok(room)
            }
        }
    }

    pub async fn fetch(&self, room_id: Uuid) -> Result<Option<Room>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query("SELECT * FROM rooms WHERE id = $1")
                    .bind(room_id)
                    .fetch_optional(pool)
                    .await
                    .context("failed to fetch room")?;
                row.as_ref().map(room_from_row).transpose()
            }
            Self::Memory(store) => Ok(store.read().await.rooms.get(&room_id).cloned()),
        }
    }

    /// Participant user ids in join order.
    pub async fn participant_ids(&self, room_id: Uuid) -> Result<Vec<Uuid>> {
        match self {
            Self::Postgres(pool) => sqlx::query_scalar::<_, Uuid>(
                "SELECT user_id FROM room_participants WHERE room_id = $1 ORDER BY joined_at ASC",
            )
            .bind(room_id)
            .fetch_all(pool)
            .await
            .context("failed to list room participants"),
            Self::Memory(store) => Ok(store
                .read()
                .await
                .participants
                .get(&room_id)
                .map(|members| members.iter().map(|member| member.user_id).collect())
                .unwrap_or_default()),
        }
    }

    /// Idempotent: the (room, user) pair is unique, re-adding is a no-op.
    pub async fn add_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO room_participants (room_id, user_id)
                    VALUES ($1, $2)
                    ON CONFLICT (room_id, user_id) DO NOTHING
                    "#,
                )
                .bind(room_id)
                .bind(user_id)
                .execute(pool)
                .await
                .context("failed to add room participant")?;
                Ok(())
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                let members = guard.participants.entry(room_id).or_default();
                if !members.iter().any(|member| member.user_id == user_id) {
                    members.push(Membership { user_id, joined_at: Utc::now() });
                }
                Ok(())
            }
        }
    }

    pub async fn remove_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query("DELETE FROM room_participants WHERE room_id = $1 AND user_id = $2")
                    .bind(room_id)
                    .bind(user_id)
                    .execute(pool)
                    .await
                    .context("failed to remove room participant")?;
                Ok(())
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                if let Some(members) = guard.participants.get_mut(&room_id) {
                    members.retain(|member| member.user_id != user_id);
                }
                Ok(())
            }
        }
    }

    pub async fn count_participants(&self, room_id: Uuid) -> Result<i64> {
        match self {
            Self::Postgres(pool) => sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM room_participants WHERE room_id = $1",
            )
            .bind(room_id)
            .fetch_one(pool)
            .await
            .context("failed to count room participants"),
            Self::Memory(store) => Ok(store
                .read()
                .await
                .participants
                .get(&room_id)
                .map(|members| members.len() as i64)
                .unwrap_or(0)),
        }
    }

    pub async fn is_host(&self, room_id: Uuid, user_id: Uuid) -> Result<bool> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_scalar::<_, i32>(
                    "SELECT 1 FROM rooms WHERE id = $1 AND host_id = $2",
                )
                .bind(room_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("failed to check room host")?;
                Ok(row.is_some())
            }
            Self::Memory(store) => Ok(store
                .read()
                .await
                .rooms
                .get(&room_id)
                .is_some_and(|room| room.host_id == user_id)),
        }
    }

    /// Apply a partial video-state update and return the updated aggregate.
    /// Returns `None` when the room does not exist.
    pub async fn update_video_state(
        &self,
        room_id: Uuid,
        update: VideoStateUpdate,
    ) -> Result<Option<Room>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query(
                    r#"
                    UPDATE rooms SET
                        video_url = COALESCE($2, video_url),
                        video_platform = COALESCE($3, video_platform),
                        "current_time" = COALESCE($4, "current_time"),
                        is_playing = COALESCE($5, is_playing),
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(room_id)
                .bind(&update.video_url)
                .bind(update.video_platform.map(VideoPlatform::as_str))
                .bind(update.current_time)
                .bind(update.is_playing)
                .fetch_optional(pool)
                .await
                .context("failed to update room video state")?;

                row.as_ref().map(room_from_row).transpose()
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                let Some(room) = guard.rooms.get_mut(&room_id) else {
                    return Ok(None);
                };
                if let Some(url) = update.video_url {
                    room.video_url = Some(url);
                }
                if let Some(platform) = update.video_platform {
                    room.video_platform = platform;
                }
                if let Some(time) = update.current_time {
                    room.current_time = time;
                }
                if let Some(playing) = update.is_playing {
                    room.is_playing = playing;
                }
                room.updated_at = Utc::now();
                Ok(Some(room.clone()))
            }
        }
    }
}

fn room_from_row(row: &PgRow) -> Result<Room> {
    let platform: String = row.try_get("video_platform").context("missing video_platform")?;
    Ok(Room {
        id: row.try_get("id").context("missing id")?,
        name: row.try_get("name").context("missing name")?,
        host_id: row.try_get("host_id").context("missing host_id")?,
        video_url: row.try_get("video_url").context("missing video_url")?,
        video_platform: platform
            .parse()
            .with_context(|| format!("room has invalid video platform '{platform}'"))?,
        current_time: row.try_get("current_time").context("missing current_time")?,
        is_playing: row.try_get("is_playing").context("missing is_playing")?,
        max_participants: row.try_get("max_participants").context("missing max_participants")?,
        is_public: row.try_get("is_public").context("missing is_public")?,
        password_hash: row.try_get("password_hash").context("missing password_hash")?,
        created_at: row.try_get("created_at").context("missing created_at")?,
        updated_at: row.try_get("updated_at").context("missing updated_at")?,
    })
}

// Core domain types shared across all cinesync crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user's public profile as attached to presence lists and chat messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: Option<String>,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// A watch-party room: one fixed host, a participant set, shared video state.
///
/// The aggregate is owned by the room store; everything the sync engine
/// broadcasts is re-read from it after a write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    /// Fixed at creation, never reassigned.
    pub host_id: Uuid,
    pub video_url: Option<String>,
    pub video_platform: VideoPlatform,
    pub current_time: f64,
    pub is_playing: bool,
    pub max_participants: i32,
    pub is_public: bool,
    /// Never serialized into room snapshots sent to clients.
    #[serde(skip_serializing, default)]
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    /// The playback state derived from the aggregate's video fields.
    pub fn video_state(&self) -> VideoState {
        VideoState { playing: self.is_playing, current_time: self.current_time }
    }
}

/// Where the room's video is hosted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VideoPlatform {
    Youtube,
    Twitch,
    Iframe,
    Custom,
}

impl VideoPlatform {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Twitch => "twitch",
            Self::Iframe => "iframe",
            Self::Custom => "custom",
        }
    }
}

impl std::str::FromStr for VideoPlatform {
    type Err = UnknownPlatform;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "youtube" => Ok(Self::Youtube),
            "twitch" => Ok(Self::Twitch),
            "iframe" => Ok(Self::Iframe),
            "custom" => Ok(Self::Custom),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown video platform '{0}'")]
pub struct UnknownPlatform(pub String);

/// Snapshot of a room's playback state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VideoState {
    pub playing: bool,
    pub current_time: f64,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

/// `System` messages are synthesized by the server (join/leave notices);
/// they never originate from a client frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    System,
    Emoji,
}

impl MessageKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
            Self::Emoji => "emoji",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(Self::Text),
            "system" => Ok(Self::System),
            "emoji" => Ok(Self::Emoji),
            other => Err(UnknownMessageKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message kind '{0}'")]
pub struct UnknownMessageKind(pub String);

/// A chat message enriched with its author's public profile, as broadcast
/// to room subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichedMessage {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub user: User,
}

/// Per-user counters maintained by the user store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStat {
    MessagesSent,
    RoomsJoined,
    RoomsCreated,
    TotalWatchTime,
}

impl UserStat {
    /// Column name in the stats table. Closed set — callers can never
    /// interpolate arbitrary identifiers into the upsert.
    pub const fn as_column(self) -> &'static str {
        match self {
            Self::MessagesSent => "messages_sent",
            Self::RoomsJoined => "rooms_joined",
            Self::RoomsCreated => "rooms_created",
            Self::TotalWatchTime => "total_watch_time",
        }
    }
}

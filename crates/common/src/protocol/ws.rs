// WebSocket frame types for the cinesync room protocol.
//
// Frames are JSON objects tagged by a `type` field. Client and server
// directions share no frames, so they are separate enums.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{EnrichedMessage, Room, User, VideoPlatform};

/// Maximum chat message length in characters, after trimming.
pub const MAX_CHAT_MESSAGE_CHARS: usize = 1000;

/// Drift above which a non-host client re-seeks to the broadcast
/// `current_time`. Smaller corrections are ignored to avoid visible jitter.
pub const DRIFT_THRESHOLD_SECS: f64 = 2.0;

/// Minimum spacing between host progress samples. The host client sends its
/// playback position as `seek` frames at most this often.
pub const HOST_PROGRESS_THROTTLE_MS: u64 = 2_000;

/// All frames a client may send after the connection is established.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bind this session to a room.
    Join {
        room_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// Unbind this session from a room.
    Leave { room_id: Uuid },

    /// Host only: start playback.
    Play { room_id: Uuid },

    /// Host only: pause playback.
    Pause { room_id: Uuid },

    /// Host only: move the playback position. Also carries throttled host
    /// progress samples.
    Seek { room_id: Uuid, time: f64 },

    /// Host only: switch to a different video.
    Change { room_id: Uuid, url: String, platform: VideoPlatform },

    /// Post a chat message.
    Message { room_id: Uuid, content: String },
}

/// All frames the server may send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full room snapshot (after join, and after a video change).
    RoomUpdate { room: Room },

    /// Full participant list for a room. Clients replace their local list
    /// wholesale; no deltas are ever sent.
    Participants { room_id: Uuid, participants: Vec<User> },

    /// A chat message enriched with the author's profile.
    NewMessage { message: EnrichedMessage },

    /// Recent chat history, oldest first, sent to a joining session.
    ChatHistory { room_id: Uuid, messages: Vec<EnrichedMessage> },

    /// Playback state changed.
    StateChanged { playing: bool, current_time: f64 },

    /// Error delivered to the originating session only.
    Error { code: String, message: String },
}

// Video sync state machine behind the authority gate.
//
// Only the room's host may mutate playback state. Every transition is
// persisted to the room aggregate before it is broadcast, so any session
// fetching the room after seeing the frame observes a consistent value.

use cinesync_common::protocol::ws::ServerEvent;
use cinesync_common::types::{Room, VideoPlatform};
use uuid::Uuid;

use crate::error::{ErrorCode, HandlerError};
use crate::metrics;
use crate::store::rooms::VideoStateUpdate;
use crate::store::Stores;
use crate::ws::registry::SessionRegistry;

/// Authority gate: rejects the command unless `user_id` is the room's host.
pub(crate) async fn require_host(
    stores: &Stores,
    room_id: Uuid,
    user_id: Uuid,
    denial: &'static str,
) -> Result<(), HandlerError> {
    if stores.rooms.is_host(room_id, user_id).await? {
        Ok(())
    } else {
        Err(HandlerError::client(ErrorCode::AuthForbidden, denial))
    }
}

pub(crate) async fn handle_play(
    stores: &Stores,
    registry: &SessionRegistry,
    user_id: Uuid,
    room_id: Uuid,
) -> Result<Vec<ServerEvent>, HandlerError> {
    require_host(stores, room_id, user_id, "Only host can control playback").await?;

    let update = VideoStateUpdate { is_playing: Some(true), ..Default::default() };
    let room = persist(stores, room_id, update).await?;
    broadcast_state(registry, &room).await;
    Ok(Vec::new())
}

pub(crate) async fn handle_pause(
    stores: &Stores,
    registry: &SessionRegistry,
    user_id: Uuid,
    room_id: Uuid,
) -> Result<Vec<ServerEvent>, HandlerError> {
    require_host(stores, room_id, user_id, "Only host can control playback").await?;

    let update = VideoStateUpdate { is_playing: Some(false), ..Default::default() };
    let room = persist(stores, room_id, update).await?;
    broadcast_state(registry, &room).await;
    Ok(Vec::new())
}

/// Seek preserves the playing flag. This is also the path host progress
/// samples arrive on (throttled client-side).
pub(crate) async fn handle_seek(
    stores: &Stores,
    registry: &SessionRegistry,
    user_id: Uuid,
    room_id: Uuid,
    time: f64,
) -> Result<Vec<ServerEvent>, HandlerError> {
    require_host(stores, room_id, user_id, "Only host can control playback").await?;

    let update = VideoStateUpdate { current_time: Some(time), ..Default::default() };
    let room = persist(stores, room_id, update).await?;
    broadcast_state(registry, &room).await;
    Ok(Vec::new())
}

/// Switching videos resets playback: time zero, paused. The whole room
/// snapshot is broadcast since the video identity changed.
pub(crate) async fn handle_change(
    stores: &Stores,
    registry: &SessionRegistry,
    user_id: Uuid,
    room_id: Uuid,
    url: String,
    platform: VideoPlatform,
) -> Result<Vec<ServerEvent>, HandlerError> {
    require_host(stores, room_id, user_id, "Only host can change video").await?;

    let update = VideoStateUpdate {
        video_url: Some(url),
        video_platform: Some(platform),
        current_time: Some(0.0),
        is_playing: Some(false),
    };
    let room = persist(stores, room_id, update).await?;
    let delivered = registry.broadcast(room_id, ServerEvent::RoomUpdate { room }).await;
    metrics::observe_broadcast(delivered);
    Ok(Vec::new())
}

async fn persist(
    stores: &Stores,
    room_id: Uuid,
    update: VideoStateUpdate,
) -> Result<Room, HandlerError> {
    stores
        .rooms
        .update_video_state(room_id, update)
        .await?
        .ok_or_else(|| HandlerError::client(ErrorCode::NotFound, "Room not found"))
}

async fn broadcast_state(registry: &SessionRegistry, room: &Room) {
    let state = room.video_state();
    let delivered = registry
        .broadcast(
            room.id,
            ServerEvent::StateChanged { playing: state.playing, current_time: state.current_time },
        )
        .await;
    metrics::observe_broadcast(delivered);
}

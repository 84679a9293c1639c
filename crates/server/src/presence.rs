// Presence tracker: the authoritative participant set per room.
//
// Every mutation is followed by a broadcast of the full, join-ordered
// participant list; clients replace their local list wholesale rather than
// merging deltas.

use anyhow::Result;
use cinesync_common::protocol::ws::ServerEvent;
use cinesync_common::types::Room;
use tracing::warn;
use uuid::Uuid;

use crate::error::{ErrorCode, HandlerError};
use crate::metrics;
use crate::store::rooms::RoomStore;
use crate::store::Stores;
use crate::ws::registry::SessionRegistry;

/// Add `user_id` to the room's participant set.
///
/// A no-op when already a member; rejected with `ROOM_FULL` when the set
/// is at capacity. The count check and the insert are separate storage
/// operations, so two racing joins at the boundary can both pass the
/// check; the store's (room, user) uniqueness still holds.
pub(crate) async fn ensure_member(
    rooms: &RoomStore,
    room: &Room,
    user_id: Uuid,
) -> Result<(), HandlerError> {
    let participants = rooms.participant_ids(room.id).await?;
    if participants.contains(&user_id) {
        return Ok(());
    }

    if participants.len() as i64 >= i64::from(room.max_participants) {
        return Err(HandlerError::client(ErrorCode::RoomFull, "Room is full"));
    }

    rooms.add_participant(room.id, user_id).await?;
    Ok(())
}

pub(crate) async fn remove_member(
    rooms: &RoomStore,
    room_id: Uuid,
    user_id: Uuid,
) -> Result<()> {
    rooms.remove_participant(room_id, user_id).await
}

/// Re-fetch the full participant list and broadcast it to the room.
/// Returns the number of sessions reached.
pub(crate) async fn broadcast_participants(
    stores: &Stores,
    registry: &SessionRegistry,
    room_id: Uuid,
) -> Result<usize> {
    let ids = stores.rooms.participant_ids(room_id).await?;
    let mut participants = Vec::with_capacity(ids.len());
    for user_id in ids {
        match stores.users.fetch(user_id).await? {
            Some(user) => participants.push(user),
            None => warn!(%user_id, %room_id, "participant has no profile, skipping"),
        }
    }

    let delivered =
        registry.broadcast(room_id, ServerEvent::Participants { room_id, participants }).await;
    metrics::observe_broadcast(delivered);
    Ok(delivered)
}

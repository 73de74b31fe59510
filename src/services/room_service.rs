use indexmap::IndexMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::room_store::RoomStore,
    dto::ws::{ChatMessageView, ServerMessage},
    error::ServiceError,
    services::{chat_service, stats_service},
    state::{
        SharedState,
        room::{PlayerRecord, RoomCode},
    },
};

/// Open a new room with the caller as its only player and leader.
///
/// On success the creator's connection is acknowledged first, then every member of
/// the room (only the creator at this point) receives the room state.
pub async fn create_room(
    state: &SharedState,
    connection: Uuid,
    room: &RoomCode,
    user_id: &str,
    username: &str,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;

    let leader = PlayerRecord::new(username, true);
    if !store.create_room(room, user_id, &leader, connection).await? {
        return Err(ServiceError::RoomAlreadyExists(room.clone()));
    }
    state.hub().subscribe(connection, room, user_id);
    info!(room = %room, user_id, "room created");

    let _ = state.hub().send(
        connection,
        &ServerMessage::CreateRoomAck {
            success: true,
            message: None,
        },
    );
    broadcast_room_update(state, &store, room).await
}

/// Add the caller to an existing room, or reattach them if they are already a member.
///
/// A returning member keeps their stats. The joining connection receives the retained
/// chat log, then the room receives the updated player list.
pub async fn join_room(
    state: &SharedState,
    connection: Uuid,
    room: &RoomCode,
    user_id: &str,
    username: &str,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;

    if !store.room_exists(room).await? {
        return Err(ServiceError::RoomNotFound(room.clone()));
    }

    if store.player(room, user_id).await?.is_some() {
        debug!(room = %room, user_id, "player rejoined");
    } else {
        let record = PlayerRecord::new(username, false);
        if !store.insert_player(room, user_id, &record).await? {
            // The last member left between the existence check and the insert.
            return Err(ServiceError::RoomNotFound(room.clone()));
        }
        info!(room = %room, user_id, "player joined");
    }
    store.touch_room(room).await?;
    store.bind_connection(connection, room, user_id).await?;
    state.hub().subscribe(connection, room, user_id);

    let history = chat_service::history(&store, room).await?;
    let _ = state.hub().send(
        connection,
        &ServerMessage::ChatHistory(history.into_iter().map(ChatMessageView::from).collect()),
    );
    broadcast_room_update(state, &store, room).await
}

/// Remove a player from a room, transferring leadership or deleting the emptied room.
///
/// Every connection of the player leaves the room's broadcast group. Leaving a room
/// that does not exist is a no-op.
pub async fn leave_room(
    state: &SharedState,
    connection: Option<Uuid>,
    room: &RoomCode,
    user_id: &str,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;

    if let Some(connection) = connection {
        state.hub().unsubscribe(connection, room);
        store.take_connection(connection).await?;
    }
    state.hub().unsubscribe_user(room, user_id);

    let generation = state.rounds().generation(room);
    let removal = store.remove_player(room, user_id).await?;
    if removal.removed {
        info!(room = %room, user_id, "player left");
    }
    if removal.emptied {
        release_room(state, room, generation);
        return Ok(());
    }

    let mut players = store.players(room).await?;
    if players.is_empty() {
        return Ok(());
    }
    ensure_leader(&store, room, &mut players).await?;

    state.hub().broadcast(
        room,
        &ServerMessage::RoomUpdate(stats_service::rank_players(players)),
    );
    Ok(())
}

/// Make sure the room has exactly one leader the pointer agrees with.
///
/// A flagged record the pointer lost track of is pointed at again. Only when no
/// record carries the flag is the first remaining player promoted.
async fn ensure_leader(
    store: &RoomStore,
    room: &RoomCode,
    players: &mut IndexMap<String, PlayerRecord>,
) -> Result<(), ServiceError> {
    let pointer = store.leader(room).await?;
    let pointer_valid = pointer
        .as_deref()
        .and_then(|leader| players.get(leader))
        .is_some_and(|record| record.is_leader);
    if pointer_valid {
        return Ok(());
    }

    let flagged = players.values().position(|record| record.is_leader);
    let Some((next_id, record)) = players.get_index_mut(flagged.unwrap_or(0)) else {
        return Ok(());
    };
    record.is_leader = true;
    if !store.promote_leader(room, next_id, record).await? {
        debug!(room = %room, user_id = %next_id, "leader candidate left before promotion");
    } else if flagged.is_some() {
        info!(room = %room, leader = %next_id, "leader pointer repaired");
    } else {
        info!(room = %room, leader = %next_id, "leadership transferred");
    }
    Ok(())
}

/// Run the leave path for a closed connection.
///
/// Nothing happens when the same user still acts in the room through another
/// connection.
pub async fn disconnect(state: &SharedState, connection: Uuid) -> Result<(), ServiceError> {
    let local = state.hub().unregister(connection);
    let store = state.require_store().await?;

    let stored = match store.take_connection(connection).await {
        Ok(stored) => stored.and_then(|binding| {
            RoomCode::parse(&binding.room_id)
                .ok()
                .map(|room| (room, binding.user_id))
        }),
        Err(err) => {
            warn!(%connection, error = %err, "failed to read connection binding");
            None
        }
    };
    let Some((room, user_id)) =
        stored.or_else(|| local.map(|binding| (binding.room, binding.user_id)))
    else {
        return Ok(());
    };

    if state.hub().user_connected_elsewhere(&room, &user_id, connection) {
        debug!(room = %room, user_id, "user still connected elsewhere; keeping membership");
        return Ok(());
    }
    leave_room(state, None, &room, &user_id).await
}

/// Broadcast the leaderboard-sorted player list as a `roomUpdate`.
pub(crate) async fn broadcast_room_update(
    state: &SharedState,
    store: &RoomStore,
    room: &RoomCode,
) -> Result<(), ServiceError> {
    let players = store.players(room).await?;
    state.hub().broadcast(
        room,
        &ServerMessage::RoomUpdate(stats_service::rank_players(players)),
    );
    Ok(())
}

/// Forget the process-local state of a room whose keys were just deleted.
///
/// A round begun after `generation` was observed belongs to a new room created
/// under the same code, and is left alone.
fn release_room(state: &SharedState, room: &RoomCode, generation: Option<u64>) {
    if state.rounds().retire(room, generation) {
        state.active_rooms().remove(room);
    }
    info!(room = %room, "room emptied and deleted");
}

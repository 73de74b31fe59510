use tracing::debug;

use crate::{
    dao::room_store::RoomStore,
    dto::ws::{ChatMessageView, ServerMessage},
    error::ServiceError,
    state::{
        SharedState,
        room::{ChatMessage, RoomCode},
    },
};

/// Broadcast a chat line from a room member and append it to the retained log.
///
/// The line carries the sender's username at send time.
pub async fn post_message(
    state: &SharedState,
    room: &RoomCode,
    user_id: &str,
    message: String,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;
    let Some(sender) = store.player(room, user_id).await? else {
        return Err(ServiceError::StaleWrite(format!(
            "`{user_id}` is not in room `{room}`"
        )));
    };

    let line = ChatMessage {
        user_id: user_id.to_string(),
        username: sender.username,
        message,
        timestamp: state.now_ms(),
    };
    state.hub().broadcast(
        room,
        &ServerMessage::ChatMessage(ChatMessageView::from(line.clone())),
    );
    store.append_chat(room, line).await?;
    debug!(room = %room, user_id, "chat message stored");
    Ok(())
}

/// Retained chat log of the room, oldest first.
pub async fn history(store: &RoomStore, room: &RoomCode) -> Result<Vec<ChatMessage>, ServiceError> {
    Ok(store.chat_history(room).await?)
}

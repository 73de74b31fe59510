use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::ws::{ClientMessage, InboundError, ServerMessage},
    error::ServiceError,
    services::{chat_service, room_service, session_service, stats_service, timer_sync},
    state::{
        SharedState,
        hub::ClientConnection,
        room::{RoomCode, StatsUpdate},
    },
};

/// Handle the full lifecycle of a client WebSocket connection.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing even while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let connection = Uuid::new_v4();
    state.hub().register(ClientConnection {
        id: connection,
        tx: outbound_tx.clone(),
    });
    info!(%connection, "client connected");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                debug!(%connection, payload = %text, "received client frame");
                dispatch(&state, connection, text.as_str()).await;
            }
            Ok(Message::Ping(payload)) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                info!(%connection, "client closed");
                let _ = outbound_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) => {}
            Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(%connection, error = %err, "websocket error");
                break;
            }
        }
    }

    if let Err(err) = room_service::disconnect(&state, connection).await {
        warn!(%connection, error = %err, "failed to clean up after disconnect");
    }
    info!(%connection, "client disconnected");

    finalize(writer_task, outbound_tx).await;
}

/// Parse one text frame and run the event it carries.
///
/// Malformed frames are logged and ignored. Failures are reported to the sending
/// connection only where the client expects an answer.
pub async fn dispatch(state: &SharedState, connection: Uuid, raw: &str) {
    let message = match ClientMessage::from_json_str(raw) {
        Ok(message) => message,
        Err(InboundError::Malformed(err)) => {
            warn!(%connection, error = %err, "failed to parse client frame");
            return;
        }
        Err(err @ InboundError::Invalid { event, .. }) => {
            warn!(%connection, error = %err, "rejected client payload");
            if event != "updateStats" {
                reply(state, connection, ServerMessage::Error {
                    message: err.to_string(),
                });
            }
            return;
        }
    };

    let event = message.event_name();
    if let Err(err) = handle(state, connection, message).await {
        report(state, connection, event, err);
    }
}

async fn handle(
    state: &SharedState,
    connection: Uuid,
    message: ClientMessage,
) -> Result<(), ServiceError> {
    match message {
        ClientMessage::CreateRoom(request) => {
            let room = RoomCode::parse(&request.room_id)?;
            room_service::create_room(state, connection, &room, &request.user_id, &request.username)
                .await
        }
        ClientMessage::JoinRoom(request) => {
            let room = RoomCode::parse(&request.room_id)?;
            room_service::join_room(state, connection, &room, &request.user_id, &request.username)
                .await
        }
        ClientMessage::LeaveRoom(request) => {
            let room = RoomCode::parse(&request.room_id)?;
            room_service::leave_room(state, Some(connection), &room, &request.user_id).await
        }
        ClientMessage::StartTest(request) => {
            let room = RoomCode::parse(&request.room_id)?;
            session_service::start_test(state, &room, &request.user_id).await
        }
        ClientMessage::EndTest(request) => {
            let room = RoomCode::parse(&request.room_id)?;
            session_service::end_test(state, connection, &room, request.user_id.as_deref()).await
        }
        ClientMessage::UpdateStats(request) => {
            let room = RoomCode::parse(&request.room_id)?;
            let update = StatsUpdate {
                wpm: request.wpm,
                progress: request.progress,
                accuracy: request.accuracy,
            };
            stats_service::update_stats(state, connection, &room, &request.user_id, update).await
        }
        ClientMessage::ChatMessage(request) => {
            let room = RoomCode::parse(&request.room_id)?;
            chat_service::post_message(state, &room, &request.user_id, request.message).await
        }
        ClientMessage::GetTimerSync(request) => {
            let room = RoomCode::parse(&request.room_id)?;
            timer_sync::get_timer_sync(state, connection, &room).await
        }
    }
}

/// Translate a failed event into what the client is allowed to see.
fn report(state: &SharedState, connection: Uuid, event: &'static str, err: ServiceError) {
    if err.is_silent() {
        debug!(%connection, event, reason = %err, "ignored client event");
        return;
    }

    let message = match (&err, event) {
        (ServiceError::InvalidInput(message), _) => message.clone(),
        (ServiceError::RoomAlreadyExists(_), _) => "Room already exists".to_string(),
        (_, "createRoom") => "Failed to create room".to_string(),
        (ServiceError::RoomNotFound(_), _) => "Room not found".to_string(),
        (_, "joinRoom") => "Failed to join room".to_string(),
        _ => {
            warn!(%connection, event, error = %err, "client event failed");
            return;
        }
    };
    warn!(%connection, event, error = %err, "client event rejected");

    let reply_message = if event == "createRoom" {
        ServerMessage::CreateRoomAck {
            success: false,
            message: Some(message),
        }
    } else {
        ServerMessage::Error { message }
    };
    reply(state, connection, reply_message);
}

fn reply(state: &SharedState, connection: Uuid, message: ServerMessage) {
    if state.hub().send(connection, &message).is_err() {
        debug!(%connection, "connection closed before reply");
    }
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}

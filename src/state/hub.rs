use std::collections::HashSet;

use axum::extract::ws::{Message, Utf8Bytes};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{dto::ws::ServerMessage, state::room::RoomCode};

/// Writer channel of the connection is closed; the socket is going away.
#[derive(Debug, Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// Handle used to push frames to a connected client.
#[derive(Clone)]
pub struct ClientConnection {
    pub id: Uuid,
    pub tx: mpsc::UnboundedSender<Message>,
}

/// Room and user a connection acts for once it created or joined a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionBinding {
    pub room: RoomCode,
    pub user_id: String,
}

/// Live WebSocket connections and the broadcast group of every room.
#[derive(Default)]
pub struct RoomHub {
    connections: DashMap<Uuid, ClientConnection>,
    members: DashMap<RoomCode, HashSet<Uuid>>,
    bindings: DashMap<Uuid, ConnectionBinding>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: ClientConnection) {
        self.connections.insert(connection.id, connection);
    }

    /// Forget a connection, returning the room binding it held.
    pub fn unregister(&self, id: Uuid) -> Option<ConnectionBinding> {
        self.connections.remove(&id);
        let (_, binding) = self.bindings.remove(&id)?;
        self.leave_group(&binding.room, id);
        Some(binding)
    }

    /// Attach a connection to a room's broadcast group, leaving any previous one.
    pub fn subscribe(&self, id: Uuid, room: &RoomCode, user_id: &str) {
        let previous = self.bindings.insert(
            id,
            ConnectionBinding {
                room: room.clone(),
                user_id: user_id.to_string(),
            },
        );
        if let Some(previous) = previous.filter(|previous| &previous.room != room) {
            self.leave_group(&previous.room, id);
        }
        self.members.entry(room.clone()).or_default().insert(id);
    }

    /// Detach a connection from `room`. Bindings to other rooms are kept.
    pub fn unsubscribe(&self, id: Uuid, room: &RoomCode) {
        if self
            .bindings
            .remove_if(&id, |_, binding| &binding.room == room)
            .is_some()
        {
            self.leave_group(room, id);
        }
    }

    /// Detach every connection acting as `user_id` from `room`.
    pub fn unsubscribe_user(&self, room: &RoomCode, user_id: &str) {
        let members: Vec<Uuid> = match self.members.get(room) {
            Some(members) => members.iter().copied().collect(),
            None => return,
        };
        for id in members {
            if self
                .bindings
                .remove_if(&id, |_, binding| &binding.room == room && binding.user_id == user_id)
                .is_some()
            {
                self.leave_group(room, id);
            }
        }
    }

    pub fn binding(&self, id: Uuid) -> Option<ConnectionBinding> {
        self.bindings.get(&id).map(|binding| binding.clone())
    }

    /// Whether `user_id` still acts in `room` through a connection other than `except`.
    pub fn user_connected_elsewhere(&self, room: &RoomCode, user_id: &str, except: Uuid) -> bool {
        let members: Vec<Uuid> = match self.members.get(room) {
            Some(members) => members.iter().copied().collect(),
            None => return false,
        };
        members.into_iter().filter(|id| *id != except).any(|id| {
            self.bindings
                .get(&id)
                .is_some_and(|binding| binding.user_id == user_id)
        })
    }

    pub fn member_count(&self, room: &RoomCode) -> usize {
        self.members.get(room).map_or(0, |members| members.len())
    }

    /// Send a message to a single connection.
    pub fn send(&self, id: Uuid, message: &ServerMessage) -> Result<(), ConnectionClosed> {
        let tx = self
            .connections
            .get(&id)
            .map(|connection| connection.tx.clone())
            .ok_or(ConnectionClosed)?;
        send_message_to_websocket(&tx, message)
    }

    /// Send a message to every connection subscribed to `room`.
    ///
    /// The frame is serialised once. Connections whose writer is gone are skipped.
    pub fn broadcast(&self, room: &RoomCode, message: &ServerMessage) {
        let targets: Vec<mpsc::UnboundedSender<Message>> = match self.members.get(room) {
            Some(members) => members
                .iter()
                .filter_map(|id| self.connections.get(id).map(|conn| conn.tx.clone()))
                .collect(),
            None => return,
        };
        if targets.is_empty() {
            return;
        }
        let Some(payload) = encode_frame(message) else {
            return;
        };
        for tx in targets {
            if tx.send(Message::Text(payload.clone())).is_err() {
                debug!(room = %room, "skipping closed connection during broadcast");
            }
        }
    }

    fn leave_group(&self, room: &RoomCode, id: Uuid) {
        if let Some(mut members) = self.members.get_mut(room) {
            members.remove(&id);
        }
        self.members.remove_if(room, |_, members| members.is_empty());
    }
}

fn encode_frame<T>(value: &T) -> Option<Utf8Bytes>
where
    T: ?Sized + Serialize + std::fmt::Debug,
{
    match serde_json::to_string(value) {
        Ok(payload) => Some(payload.into()),
        Err(err) => {
            warn!(error = %err, "failed to serialize message `{value:?}`");
            None
        }
    }
}

/// Serialize a payload and push it onto the provided WebSocket sender.
///
/// A serialisation failure is logged and swallowed. A closed writer is reported to
/// the caller so it can stop serving the connection.
pub fn send_message_to_websocket<T>(
    tx: &mpsc::UnboundedSender<Message>,
    value: &T,
) -> Result<(), ConnectionClosed>
where
    T: ?Sized + Serialize + std::fmt::Debug,
{
    let Some(payload) = encode_frame(value) else {
        return Ok(());
    };
    tx.send(Message::Text(payload)).map_err(|_| ConnectionClosed)
}

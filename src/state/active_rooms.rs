use dashmap::DashSet;
use tracing::info;

use crate::state::room::RoomCode;

/// Process-local index of rooms believed to have a running round.
///
/// This is a cache over the session timestamps in the store. It starts empty,
/// may be lost at any time and is reconciled against the store on every timer
/// sync tick.
#[derive(Debug, Default)]
pub struct ActiveRoomRegistry {
    rooms: DashSet<RoomCode>,
}

impl ActiveRoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, room: &RoomCode) {
        if self.rooms.insert(room.clone()) {
            info!(room = %room, active = self.rooms.len(), "tracking active room");
        }
    }

    /// Stop tracking `room`, returning whether it was tracked.
    pub fn remove(&self, room: &RoomCode) -> bool {
        let removed = self.rooms.remove(room).is_some();
        if removed {
            info!(room = %room, active = self.rooms.len(), "stopped tracking room");
        }
        removed
    }

    pub fn contains(&self, room: &RoomCode) -> bool {
        self.rooms.contains(room)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Copy of the tracked rooms, so callers never hold a shard lock across awaits.
    pub fn snapshot(&self) -> Vec<RoomCode> {
        self.rooms.iter().map(|room| room.key().clone()).collect()
    }
}

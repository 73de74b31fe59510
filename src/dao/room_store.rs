use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;
use uuid::Uuid;

use crate::{
    config::StoreLimits,
    dao::{
        kv_store::{Batch, Command, FieldRemoval, HashCondition, KvStore},
        models::{ChatMessageEntity, ConnectionBindingEntity, PlayerEntity},
        storage::{StorageError, StorageResult},
    },
    state::room::{ChatMessage, PlayerRecord, RoomCode},
};

const ROOM_PREFIX: &str = "room:";
const SESSION_SUFFIX: &str = ":testStartTime";

fn room_key(room: &RoomCode) -> String {
    format!("{ROOM_PREFIX}{room}")
}

fn leader_key(room: &RoomCode) -> String {
    format!("{ROOM_PREFIX}{room}:leader")
}

fn session_key(room: &RoomCode) -> String {
    format!("{ROOM_PREFIX}{room}{SESSION_SUFFIX}")
}

fn messages_key(room: &RoomCode) -> String {
    format!("{ROOM_PREFIX}{room}:messages")
}

fn connection_key(connection: Uuid) -> String {
    format!("socket:{connection}")
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> StorageResult<T> {
    serde_json::from_str(raw).map_err(|source| StorageError::Decode {
        key: key.to_string(),
        source,
    })
}

fn encode<T: Serialize>(key: &str, value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|source| StorageError::Encode {
        key: key.to_string(),
        source,
    })
}

fn encode_player(key: &str, record: &PlayerRecord) -> StorageResult<String> {
    encode(key, &PlayerEntity::from(record.clone()))
}

/// Liveness of a room's backing keys, used to reconcile the active room registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLiveness {
    pub room_exists: bool,
    pub session_exists: bool,
}

impl SessionLiveness {
    /// A round is live only while both the room and its start timestamp exist.
    pub fn is_live(&self) -> bool {
        self.room_exists && self.session_exists
    }
}

/// Typed access to room-scoped state in the key-value store.
///
/// Owns the key layout and the JSON contract of every stored record. Callers never
/// see raw keys.
#[derive(Clone)]
pub struct RoomStore {
    kv: Arc<dyn KvStore>,
    limits: StoreLimits,
}

impl RoomStore {
    pub fn new(kv: Arc<dyn KvStore>, limits: StoreLimits) -> Self {
        Self { kv, limits }
    }

    pub async fn health_check(&self) -> StorageResult<()> {
        self.kv.health_check().await
    }

    pub async fn room_exists(&self, room: &RoomCode) -> StorageResult<bool> {
        self.kv.exists(room_key(room)).await
    }

    /// Create a room holding only `leader`, bound to the creator's `connection`.
    ///
    /// The existence check and every write happen in one atomic store call, so of
    /// two concurrent creators exactly one wins. Leftover session and chat keys of a
    /// previous room with the same code are cleared. Returns `false` if the code is
    /// taken.
    pub async fn create_room(
        &self,
        room: &RoomCode,
        leader_id: &str,
        leader: &PlayerRecord,
        connection: Uuid,
    ) -> StorageResult<bool> {
        let key = room_key(room);
        let batch = Batch::new()
            .push(Command::HSet {
                key: key.clone(),
                field: leader_id.to_string(),
                value: encode_player(&key, leader)?,
            })
            .push(Command::Expire {
                key: key.clone(),
                ttl: self.limits.room_ttl,
            })
            .push(Command::Set {
                key: leader_key(room),
                value: leader_id.to_string(),
                ttl: Some(self.limits.room_ttl),
            })
            .push(Command::Del {
                key: session_key(room),
            })
            .push(Command::Del {
                key: messages_key(room),
            })
            .push(self.binding_command(connection, room, leader_id)?);
        self.kv.exec_if_absent(key, batch).await
    }

    /// Extend the room and leader expiry after activity.
    pub async fn touch_room(&self, room: &RoomCode) -> StorageResult<()> {
        let batch = Batch::new()
            .push(Command::Expire {
                key: room_key(room),
                ttl: self.limits.room_ttl,
            })
            .push(Command::Expire {
                key: leader_key(room),
                ttl: self.limits.room_ttl,
            });
        self.kv.exec(batch).await
    }

    /// All players of the room in insertion order. Empty when the room is gone.
    pub async fn players(&self, room: &RoomCode) -> StorageResult<IndexMap<String, PlayerRecord>> {
        let key = room_key(room);
        self.kv
            .hgetall(key.clone())
            .await?
            .into_iter()
            .map(|(user_id, raw)| {
                let entity: PlayerEntity = decode(&key, &raw)?;
                Ok((user_id, entity.into()))
            })
            .collect()
    }

    pub async fn player(&self, room: &RoomCode, user_id: &str) -> StorageResult<Option<PlayerRecord>> {
        let key = room_key(room);
        match self.kv.hget(key.clone(), user_id.to_string()).await? {
            Some(raw) => {
                let entity: PlayerEntity = decode(&key, &raw)?;
                Ok(Some(entity.into()))
            }
            None => Ok(None),
        }
    }

    /// Add a player to an existing room. Returns `false` when the room does not exist.
    pub async fn insert_player(
        &self,
        room: &RoomCode,
        user_id: &str,
        record: &PlayerRecord,
    ) -> StorageResult<bool> {
        let key = room_key(room);
        let value = encode_player(&key, record)?;
        self.kv
            .hset_if(key, user_id.to_string(), value, HashCondition::KeyExists)
            .await
    }

    /// Overwrite a player still present in the room. Returns `false` when they left.
    pub async fn replace_player(
        &self,
        room: &RoomCode,
        user_id: &str,
        record: &PlayerRecord,
    ) -> StorageResult<bool> {
        let key = room_key(room);
        let value = encode_player(&key, record)?;
        self.kv
            .hset_if(key, user_id.to_string(), value, HashCondition::FieldExists)
            .await
    }

    /// Remove a player. When they were the last one, the leader pointer, session
    /// and chat log are deleted in the same atomic step, so the room never lingers
    /// half deleted.
    pub async fn remove_player(&self, room: &RoomCode, user_id: &str) -> StorageResult<FieldRemoval> {
        let leftovers = [leader_key(room), messages_key(room), session_key(room)]
            .into_iter()
            .fold(Batch::new(), |batch, key| batch.push(Command::Del { key }));
        self.kv
            .hdel_cascade(room_key(room), user_id.to_string(), leftovers)
            .await
    }

    /// Persist the reset records of a new round and extend the room expiry.
    ///
    /// Each write is conditional on the player still being present, so a reset
    /// racing the last leave cannot bring the room back.
    pub async fn reset_players(
        &self,
        room: &RoomCode,
        players: &IndexMap<String, PlayerRecord>,
    ) -> StorageResult<()> {
        for (user_id, record) in players {
            self.replace_player(room, user_id, record).await?;
        }
        self.touch_room(room).await
    }

    pub async fn leader(&self, room: &RoomCode) -> StorageResult<Option<String>> {
        self.kv.get(leader_key(room)).await
    }

    /// Persist the promoted record of `user_id` and point the leader key at them.
    ///
    /// Returns `false`, writing nothing, when the player has already left. The
    /// room's remaining expiry is carried over to the leader key.
    pub async fn promote_leader(
        &self,
        room: &RoomCode,
        user_id: &str,
        record: &PlayerRecord,
    ) -> StorageResult<bool> {
        if !self.replace_player(room, user_id, record).await? {
            return Ok(false);
        }
        let ttl = self.kv.ttl(room_key(room)).await?.filter(|ttl| !ttl.is_zero());
        self.kv.set(leader_key(room), user_id.to_string(), ttl).await?;
        Ok(true)
    }

    /// Start timestamp of the running round, in milliseconds since the Unix epoch.
    pub async fn session_start(&self, room: &RoomCode) -> StorageResult<Option<u64>> {
        let key = session_key(room);
        match self.kv.get(key.clone()).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn begin_session(&self, room: &RoomCode, started_at_ms: u64) -> StorageResult<()> {
        self.kv
            .set(
                session_key(room),
                started_at_ms.to_string(),
                Some(self.limits.session_ttl),
            )
            .await
    }

    /// Atomically remove the session timestamp, returning it if this call removed it.
    pub async fn take_session(&self, room: &RoomCode) -> StorageResult<Option<u64>> {
        let key = session_key(room);
        match self.kv.take(key.clone()).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Remove the session timestamp only if it still marks the round started at
    /// `started_at_ms`.
    pub async fn end_session_if(&self, room: &RoomCode, started_at_ms: u64) -> StorageResult<bool> {
        self.kv
            .delete_if_equals(session_key(room), started_at_ms.to_string())
            .await
    }

    pub async fn session_liveness(&self, room: &RoomCode) -> StorageResult<SessionLiveness> {
        Ok(SessionLiveness {
            room_exists: self.kv.exists(room_key(room)).await?,
            session_exists: self.kv.exists(session_key(room)).await?,
        })
    }

    /// Rooms whose session timestamp is present in the store.
    pub async fn session_rooms(&self) -> StorageResult<Vec<RoomCode>> {
        let keys = self.kv.keys(ROOM_PREFIX.to_string()).await?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                key.strip_prefix(ROOM_PREFIX)?
                    .strip_suffix(SESSION_SUFFIX)
                    .and_then(|code| RoomCode::parse(code).ok())
            })
            .collect())
    }

    /// Append a message, refresh the log expiry and trim it to the retention cap.
    pub async fn append_chat(&self, room: &RoomCode, message: ChatMessage) -> StorageResult<()> {
        let key = messages_key(room);
        let value = encode(&key, &ChatMessageEntity::from(message))?;
        let batch = Batch::new()
            .push(Command::RPush {
                key: key.clone(),
                value,
            })
            .push(Command::Expire {
                key: key.clone(),
                ttl: self.limits.chat_ttl,
            })
            .push(Command::LTrim {
                key,
                keep_last: self.limits.chat_cap,
            });
        self.kv.exec(batch).await
    }

    /// Retained chat log, oldest first. Malformed entries are skipped.
    pub async fn chat_history(&self, room: &RoomCode) -> StorageResult<Vec<ChatMessage>> {
        let key = messages_key(room);
        let entries = self.kv.lrange(key.clone()).await?;
        Ok(entries
            .iter()
            .filter_map(|raw| match decode::<ChatMessageEntity>(&key, raw) {
                Ok(entity) => Some(entity.into()),
                Err(err) => {
                    warn!(error = %err, "skipping malformed chat entry");
                    None
                }
            })
            .collect())
    }

    /// Remember which room and user a connection is attached to.
    pub async fn bind_connection(
        &self,
        connection: Uuid,
        room: &RoomCode,
        user_id: &str,
    ) -> StorageResult<()> {
        let batch = Batch::new().push(self.binding_command(connection, room, user_id)?);
        self.kv.exec(batch).await
    }

    fn binding_command(
        &self,
        connection: Uuid,
        room: &RoomCode,
        user_id: &str,
    ) -> StorageResult<Command> {
        let key = connection_key(connection);
        let value = encode(
            &key,
            &ConnectionBindingEntity {
                user_id: user_id.to_string(),
                room_id: room.to_string(),
            },
        )?;
        Ok(Command::Set {
            key,
            value,
            ttl: Some(self.limits.connection_ttl),
        })
    }

    /// Remove and return a connection binding.
    pub async fn take_connection(
        &self,
        connection: Uuid,
    ) -> StorageResult<Option<ConnectionBindingEntity>> {
        let key = connection_key(connection);
        match self.kv.take(key.clone()).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }
}

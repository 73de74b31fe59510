use serde::{Deserialize, Serialize};

/// Player record stored as one field of the `room:{id}` hash, keyed by user id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerEntity {
    /// Display name captured when the player joined.
    pub username: String,
    /// Live words per minute.
    pub wpm: f64,
    /// Percentage of the target text typed, 0 to 100.
    pub progress: f64,
    /// Live accuracy percentage.
    pub accuracy: f64,
    /// Whether this player currently leads the room.
    pub is_leader: bool,
    /// Whether the player completed the current round.
    pub finished: bool,
    /// Seconds elapsed since the round started when the player finished.
    #[serde(default)]
    pub finish_time: Option<u64>,
    /// Samples collected during the current round, oldest first.
    #[serde(default)]
    pub performance_history: Vec<PerformanceSampleEntity>,
}

/// Single telemetry sample appended on every stats update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PerformanceSampleEntity {
    pub time: u64,
    pub wpm: f64,
    pub progress: f64,
    pub accuracy: f64,
}

/// Chat message stored in the `room:{id}:messages` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageEntity {
    pub user_id: String,
    pub username: String,
    pub message: String,
    /// Server time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Room and user a connection is attached to, stored under `socket:{connection id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionBindingEntity {
    pub user_id: String,
    pub room_id: String,
}

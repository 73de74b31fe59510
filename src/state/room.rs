use std::fmt;

use crate::dao::models::{ChatMessageEntity, PerformanceSampleEntity, PlayerEntity};

/// Longest room code accepted from clients.
pub const MAX_ROOM_CODE_LEN: usize = 16;
/// Accuracy assigned before any keystroke is recorded.
pub const INITIAL_ACCURACY: f64 = 100.0;
/// Progress at which a player counts as finished.
pub const COMPLETE_PROGRESS: f64 = 100.0;

/// Identifier players type to share a room, trimmed and upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomCode(String);

/// Reason a raw room code was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRoomCode {
    #[error("room code must not be empty")]
    Empty,
    #[error("room code must be at most {MAX_ROOM_CODE_LEN} characters")]
    TooLong,
    #[error("room code may only contain letters, digits, `-` and `_`")]
    InvalidCharacter,
}

impl RoomCode {
    /// Normalise a human-typed code.
    pub fn parse(raw: &str) -> Result<Self, InvalidRoomCode> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidRoomCode::Empty);
        }
        if trimmed.chars().count() > MAX_ROOM_CODE_LEN {
            return Err(InvalidRoomCode::TooLong);
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(InvalidRoomCode::InvalidCharacter);
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Telemetry reported by a client while typing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsUpdate {
    pub wpm: f64,
    pub progress: f64,
    pub accuracy: f64,
}

/// Immutable point of a player's performance curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSample {
    /// Whole seconds since the round started.
    pub time: u64,
    pub wpm: f64,
    pub progress: f64,
    pub accuracy: f64,
}

/// Effect of a stats update on a player record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsOutcome {
    /// The player already finished; the record is frozen.
    Frozen,
    /// Live fields were overwritten and a sample appended.
    Recorded,
    /// The update completed the text; `finish_time` is now set.
    Finished,
}

/// Live state of one player inside a room.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRecord {
    pub username: String,
    pub wpm: f64,
    pub progress: f64,
    pub accuracy: f64,
    pub is_leader: bool,
    pub finished: bool,
    pub finish_time: Option<u64>,
    pub performance_history: Vec<PerformanceSample>,
}

impl PlayerRecord {
    /// Fresh record with default stats.
    pub fn new(username: impl Into<String>, is_leader: bool) -> Self {
        Self {
            username: username.into(),
            wpm: 0.0,
            progress: 0.0,
            accuracy: INITIAL_ACCURACY,
            is_leader,
            finished: false,
            finish_time: None,
            performance_history: Vec::new(),
        }
    }

    /// Discard the previous round's stats, keeping identity and role.
    pub fn reset_for_round(&mut self) {
        *self = Self::new(std::mem::take(&mut self.username), self.is_leader);
    }

    /// Apply a client update observed `elapsed` seconds into the round.
    ///
    /// Progress never moves backwards within a round; a finished record is left
    /// untouched.
    pub fn record(&mut self, elapsed: u64, update: StatsUpdate) -> StatsOutcome {
        if self.finished {
            return StatsOutcome::Frozen;
        }

        self.wpm = update.wpm;
        self.accuracy = update.accuracy;
        self.progress = update.progress.clamp(0.0, COMPLETE_PROGRESS).max(self.progress);
        self.performance_history.push(PerformanceSample {
            time: elapsed,
            wpm: self.wpm,
            progress: self.progress,
            accuracy: self.accuracy,
        });

        if self.progress >= COMPLETE_PROGRESS {
            self.finished = true;
            self.finish_time = Some(elapsed);
            StatsOutcome::Finished
        } else {
            StatsOutcome::Recorded
        }
    }
}

/// Chat line as broadcast and retained in the room log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub user_id: String,
    pub username: String,
    pub message: String,
    pub timestamp: u64,
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() { value } else { fallback }
}

impl From<PerformanceSampleEntity> for PerformanceSample {
    fn from(value: PerformanceSampleEntity) -> Self {
        Self {
            time: value.time,
            wpm: finite_or(value.wpm, 0.0),
            progress: finite_or(value.progress, 0.0).clamp(0.0, COMPLETE_PROGRESS),
            accuracy: finite_or(value.accuracy, INITIAL_ACCURACY),
        }
    }
}

impl From<PerformanceSample> for PerformanceSampleEntity {
    fn from(value: PerformanceSample) -> Self {
        Self {
            time: value.time,
            wpm: value.wpm,
            progress: value.progress,
            accuracy: value.accuracy,
        }
    }
}

impl From<PlayerEntity> for PlayerRecord {
    fn from(value: PlayerEntity) -> Self {
        Self {
            username: value.username,
            wpm: finite_or(value.wpm, 0.0).max(0.0),
            progress: finite_or(value.progress, 0.0).clamp(0.0, COMPLETE_PROGRESS),
            accuracy: finite_or(value.accuracy, INITIAL_ACCURACY),
            is_leader: value.is_leader,
            finished: value.finished,
            finish_time: value.finish_time,
            performance_history: value
                .performance_history
                .into_iter()
                .map(Into::into)
                .collect(),
        }
    }
}

impl From<PlayerRecord> for PlayerEntity {
    fn from(value: PlayerRecord) -> Self {
        Self {
            username: value.username,
            wpm: value.wpm,
            progress: value.progress,
            accuracy: value.accuracy,
            is_leader: value.is_leader,
            finished: value.finished,
            finish_time: value.finish_time,
            performance_history: value
                .performance_history
                .into_iter()
                .map(Into::into)
                .collect(),
        }
    }
}

impl From<ChatMessageEntity> for ChatMessage {
    fn from(value: ChatMessageEntity) -> Self {
        Self {
            user_id: value.user_id,
            username: value.username,
            message: value.message,
            timestamp: value.timestamp,
        }
    }
}

impl From<ChatMessage> for ChatMessageEntity {
    fn from(value: ChatMessage) -> Self {
        Self {
            user_id: value.user_id,
            username: value.username,
            message: value.message,
            timestamp: value.timestamp,
        }
    }
}

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use validator::{Validate, ValidationErrors};

use crate::{
    dto::validation::validate_room_code,
    state::{
        room::{ChatMessage, PlayerRecord},
        session::EndReason,
    },
};

/// Payload of `createRoom` and `joinRoom`.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RoomEntryRequest {
    #[validate(custom(function = "validate_room_code"))]
    pub room_id: String,
    #[validate(length(min = 1, max = 64))]
    pub user_id: String,
    #[validate(length(min = 1, max = 64))]
    pub username: String,
}

/// Payload of `leaveRoom` and `startTest`.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RoomActionRequest {
    #[validate(custom(function = "validate_room_code"))]
    pub room_id: String,
    #[validate(length(min = 1, max = 64))]
    pub user_id: String,
}

/// Payload of `endTest`. Without `userId` the connection's bound user is checked.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EndTestRequest {
    #[validate(custom(function = "validate_room_code"))]
    pub room_id: String,
    #[serde(default)]
    #[validate(length(min = 1, max = 64))]
    pub user_id: Option<String>,
}

/// Live typing telemetry reported by a client.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StatsReportRequest {
    #[validate(custom(function = "validate_room_code"))]
    pub room_id: String,
    #[validate(length(min = 1, max = 64))]
    pub user_id: String,
    #[validate(range(min = 0.0))]
    pub wpm: f64,
    /// Clamped to 0–100 server side.
    pub progress: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub accuracy: f64,
}

/// Payload of `chatMessage` sent by a client.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatPostRequest {
    #[validate(custom(function = "validate_room_code"))]
    pub room_id: String,
    #[validate(length(min = 1, max = 64))]
    pub user_id: String,
    #[validate(length(min = 1, max = 500))]
    pub message: String,
}

/// Payload of `getTimerSync`.
#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TimerSyncRequest {
    #[validate(custom(function = "validate_room_code"))]
    pub room_id: String,
}

/// Events accepted from WebSocket clients, framed as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    CreateRoom(RoomEntryRequest),
    JoinRoom(RoomEntryRequest),
    LeaveRoom(RoomActionRequest),
    StartTest(RoomActionRequest),
    EndTest(EndTestRequest),
    UpdateStats(StatsReportRequest),
    ChatMessage(ChatPostRequest),
    GetTimerSync(TimerSyncRequest),
}

/// Reasons an inbound frame is rejected before dispatch.
#[derive(Debug, Error)]
pub enum InboundError {
    /// Not JSON, unknown event or wrong payload shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Well-formed frame whose payload failed validation.
    #[error("invalid `{event}` payload: {errors}")]
    Invalid {
        event: &'static str,
        errors: ValidationErrors,
    },
}

impl ClientMessage {
    /// Parse and validate a text frame.
    pub fn from_json_str(raw: &str) -> Result<Self, InboundError> {
        let message: Self = serde_json::from_str(raw)?;
        message
            .validate_payload()
            .map_err(|errors| InboundError::Invalid {
                event: message.event_name(),
                errors,
            })?;
        Ok(message)
    }

    /// Wire name of the event.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CreateRoom(_) => "createRoom",
            Self::JoinRoom(_) => "joinRoom",
            Self::LeaveRoom(_) => "leaveRoom",
            Self::StartTest(_) => "startTest",
            Self::EndTest(_) => "endTest",
            Self::UpdateStats(_) => "updateStats",
            Self::ChatMessage(_) => "chatMessage",
            Self::GetTimerSync(_) => "getTimerSync",
        }
    }

    fn validate_payload(&self) -> Result<(), ValidationErrors> {
        match self {
            Self::CreateRoom(payload) | Self::JoinRoom(payload) => payload.validate(),
            Self::LeaveRoom(payload) | Self::StartTest(payload) => payload.validate(),
            Self::EndTest(payload) => payload.validate(),
            Self::UpdateStats(payload) => payload.validate(),
            Self::ChatMessage(payload) => payload.validate(),
            Self::GetTimerSync(payload) => payload.validate(),
        }
    }
}

/// Player entry of `roomUpdate` and `liveStats`, sorted by the leaderboard order.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub user_id: String,
    pub username: String,
    pub wpm: f64,
    pub progress: f64,
    pub accuracy: f64,
    pub is_leader: bool,
    pub finished: bool,
    pub finish_time: Option<u64>,
}

impl From<(String, PlayerRecord)> for PlayerView {
    fn from((user_id, record): (String, PlayerRecord)) -> Self {
        Self {
            user_id,
            username: record.username,
            wpm: record.wpm,
            progress: record.progress,
            accuracy: record.accuracy,
            is_leader: record.is_leader,
            finished: record.finished,
            finish_time: record.finish_time,
        }
    }
}

/// Chat line as pushed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageView {
    pub user_id: String,
    pub username: String,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl From<ChatMessage> for ChatMessageView {
    fn from(value: ChatMessage) -> Self {
        Self {
            user_id: value.user_id,
            username: value.username,
            message: value.message,
            timestamp: value.timestamp,
        }
    }
}

/// Server-authoritative view of a room's round clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimerSyncView {
    /// Whole seconds left in the round.
    pub remaining: u64,
    pub running: bool,
    /// Milliseconds since the Unix epoch when the value was computed.
    pub server_time: u64,
}

/// Events pushed to WebSocket clients, framed as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Reply to `createRoom`, sent only to the creator.
    CreateRoomAck {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    RoomUpdate(Vec<PlayerView>),
    LiveStats(Vec<PlayerView>),
    /// Retained log, sent once to a joining connection.
    ChatHistory(Vec<ChatMessageView>),
    ChatMessage(ChatMessageView),
    GameStarting {
        countdown: u32,
    },
    CountdownUpdate {
        countdown: u32,
    },
    TestStarted {
        #[serde(rename = "startTime")]
        start_time: u64,
    },
    TimerSync(TimerSyncView),
    TestEnded {
        reason: EndReason,
    },
    /// Sent only to the connection whose update finished the text.
    PlayerFinished {
        message: String,
    },
    Error {
        message: String,
    },
}

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::{
    dto::validation::validate_room_code,
    state::room::{PerformanceSample, PlayerRecord},
};

/// Path parameters of `GET /results/{roomId}`.
#[derive(Debug, Deserialize, IntoParams, Validate)]
#[into_params(parameter_in = Path)]
pub struct ResultsPath {
    /// Room code, case-insensitive.
    #[validate(custom(function = "validate_room_code"))]
    pub room_id: String,
}

/// One point of a player's performance curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct PerformanceSampleView {
    /// Whole seconds since the round started.
    pub time: u64,
    pub wpm: f64,
    pub progress: f64,
    pub accuracy: f64,
}

impl From<PerformanceSample> for PerformanceSampleView {
    fn from(value: PerformanceSample) -> Self {
        Self {
            time: value.time,
            wpm: value.wpm,
            progress: value.progress,
            accuracy: value.accuracy,
        }
    }
}

/// Final standing of one player, used to render post-round charts.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResult {
    pub user_id: String,
    pub username: String,
    pub final_wpm: f64,
    pub final_accuracy: f64,
    pub final_progress: f64,
    pub finished: bool,
    pub finish_time: Option<u64>,
    pub performance_history: Vec<PerformanceSampleView>,
}

impl From<(String, PlayerRecord)> for PlayerResult {
    fn from((user_id, record): (String, PlayerRecord)) -> Self {
        Self {
            user_id,
            username: record.username,
            final_wpm: record.wpm,
            final_accuracy: record.accuracy,
            final_progress: record.progress,
            finished: record.finished,
            finish_time: record.finish_time,
            performance_history: record
                .performance_history
                .into_iter()
                .map(Into::into)
                .collect(),
        }
    }
}

/// Body of `GET /results/{roomId}`.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ResultsResponse {
    pub players: Vec<PlayerResult>,
}

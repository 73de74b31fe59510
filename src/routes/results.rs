use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use axum_valid::Valid;

use crate::{
    dto::results::{ResultsPath, ResultsResponse},
    error::{AppError, ErrorBody},
    services::stats_service,
    state::{SharedState, room::RoomCode},
};

/// Routes exposing post-round standings.
pub fn router() -> Router<SharedState> {
    Router::new().route("/results/{room_id}", get(get_results))
}

/// Final standings and performance curves of every player in a room.
#[utoipa::path(
    get,
    path = "/results/{room_id}",
    tag = "results",
    params(ResultsPath),
    responses(
        (status = 200, description = "Standings of the room", body = ResultsResponse),
        (status = 400, description = "Malformed room code", body = ErrorBody),
        (status = 404, description = "Room does not exist", body = ErrorBody)
    )
)]
pub async fn get_results(
    State(state): State<SharedState>,
    Valid(Path(path)): Valid<Path<ResultsPath>>,
) -> Result<Json<ResultsResponse>, AppError> {
    let room = RoomCode::parse(&path.room_id).map_err(|err| AppError::BadRequest(err.to_string()))?;
    let results = stats_service::get_results(&state, &room).await?;
    Ok(Json(results))
}

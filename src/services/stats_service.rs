use std::cmp::Ordering;

use indexmap::IndexMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    dto::{
        results::{PlayerResult, ResultsResponse},
        ws::{PlayerView, ServerMessage},
    },
    error::ServiceError,
    services::session_service,
    state::{
        SharedState,
        clock::elapsed_secs,
        room::{PlayerRecord, RoomCode, StatsOutcome, StatsUpdate},
        session::EndReason,
    },
};

const FINISHED_MESSAGE: &str = "You finished!";

/// Leaderboard order: WPM descending, ties broken by progress descending.
///
/// Players tied on both keep their room order.
pub fn rank_players(players: IndexMap<String, PlayerRecord>) -> Vec<PlayerView> {
    let mut ranked: Vec<PlayerView> = players.into_iter().map(PlayerView::from).collect();
    ranked.sort_by(|a, b| compare_standing(b, a));
    ranked
}

fn compare_standing(a: &PlayerView, b: &PlayerView) -> Ordering {
    a.wpm
        .total_cmp(&b.wpm)
        .then_with(|| a.progress.total_cmp(&b.progress))
}

/// Record a live stats report for a player in a running round.
///
/// Finished players and rooms without a running round are left untouched. When the
/// update completes the last unfinished player the round ends with `all_finished`
/// instead of a `liveStats` broadcast.
pub async fn update_stats(
    state: &SharedState,
    connection: Uuid,
    room: &RoomCode,
    user_id: &str,
    update: StatsUpdate,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;

    let Some(mut record) = store.player(room, user_id).await? else {
        return Err(ServiceError::StaleWrite(format!(
            "`{user_id}` is not in room `{room}`"
        )));
    };
    if record.finished {
        debug!(room = %room, user_id, "ignoring stats from finished player");
        return Ok(());
    }
    let Some(started_at_ms) = store.session_start(room).await? else {
        debug!(room = %room, user_id, "ignoring stats outside a running round");
        return Ok(());
    };

    let elapsed = elapsed_secs(started_at_ms, state.now_ms());
    let outcome = record.record(elapsed, update);
    if !store.replace_player(room, user_id, &record).await? {
        return Err(ServiceError::StaleWrite(format!(
            "`{user_id}` left room `{room}` during the update"
        )));
    }
    if outcome == StatsOutcome::Finished {
        info!(room = %room, user_id, finish_time = elapsed, "player finished");
    }

    let players = store.players(room).await?;
    if !players.is_empty() && players.values().all(|player| player.finished) {
        session_service::end_round(state, &store, room, EndReason::AllFinished).await?;
        return Ok(());
    }

    state
        .hub()
        .broadcast(room, &ServerMessage::LiveStats(rank_players(players)));
    if outcome == StatsOutcome::Finished {
        let _ = state.hub().send(
            connection,
            &ServerMessage::PlayerFinished {
                message: FINISHED_MESSAGE.to_string(),
            },
        );
    }
    Ok(())
}

/// Read-only projection of the room's final standings, in room order.
pub async fn get_results(
    state: &SharedState,
    room: &RoomCode,
) -> Result<ResultsResponse, ServiceError> {
    let store = state.require_store().await?;
    let players = store.players(room).await?;
    if players.is_empty() {
        return Err(ServiceError::RoomNotFound(room.clone()));
    }
    Ok(ResultsResponse {
        players: players.into_iter().map(PlayerResult::from).collect(),
    })
}

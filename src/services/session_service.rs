use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::COUNTDOWN_TICK,
    dao::room_store::RoomStore,
    dto::ws::ServerMessage,
    error::ServiceError,
    state::{
        SharedState,
        room::RoomCode,
        session::{EndReason, SessionEvent, SessionPhase},
    },
};

/// Start a new round in `room` on behalf of its leader.
///
/// Every player's stats are reset, the room is tracked as active and the countdown
/// task is spawned. A round already counting down or running is discarded.
pub async fn start_test(
    state: &SharedState,
    room: &RoomCode,
    user_id: &str,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;
    ensure_leader(&store, room, user_id).await?;

    let mut players = store.players(room).await?;
    if players.is_empty() {
        return Err(ServiceError::RoomNotFound(room.clone()));
    }

    let countdown = state.config().round().countdown_ticks;
    let generation = state.rounds().begin(room, countdown);
    let prepared = async {
        if let Some(previous) = store.take_session(room).await? {
            info!(room = %room, started_at_ms = previous, "discarding round for restart");
        }
        players.values_mut().for_each(|record| record.reset_for_round());
        store.reset_players(room, &players).await
    }
    .await;
    if let Err(err) = prepared {
        state.rounds().abandon(room, generation);
        return Err(err.into());
    }

    state.active_rooms().add(room);
    state
        .hub()
        .broadcast(room, &ServerMessage::GameStarting { countdown });
    info!(room = %room, user_id, generation, "round countdown started");

    let task = tokio::spawn(run_round(state.clone(), room.clone(), generation));
    state.rounds().attach(room, generation, task);
    Ok(())
}

/// Force the round in `room` to end on behalf of its leader.
///
/// The leader is identified by `user_id`, or by the user bound to `connection`
/// when the request carries none.
pub async fn end_test(
    state: &SharedState,
    connection: Uuid,
    room: &RoomCode,
    user_id: Option<&str>,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;
    let caller = match user_id {
        Some(user_id) => user_id.to_string(),
        None => state
            .hub()
            .binding(connection)
            .filter(|binding| &binding.room == room)
            .map(|binding| binding.user_id)
            .ok_or_else(|| {
                ServiceError::NotAuthorized(format!("connection is not bound to room `{room}`"))
            })?,
    };
    ensure_leader(&store, room, &caller).await?;

    if !end_round(state, &store, room, EndReason::ManualEnd).await? {
        debug!(room = %room, "no round to end");
    }
    Ok(())
}

/// End the current round of `room` for `reason`, returning whether this call ended it.
///
/// The session timestamp is taken from the store, so concurrent enders cannot both
/// succeed. A manual end also stops a countdown that has not launched yet.
pub(crate) async fn end_round(
    state: &SharedState,
    store: &RoomStore,
    room: &RoomCode,
    reason: EndReason,
) -> Result<bool, ServiceError> {
    let ended = match store.take_session(room).await? {
        Some(started_at_ms) => {
            if let Some(round) = state.rounds().end_running(room, reason, started_at_ms) {
                round.abort();
            }
            true
        }
        None if reason == EndReason::ManualEnd => state
            .rounds()
            .cancel_countdown(room)
            .map(|round| round.abort())
            .is_some(),
        None => false,
    };

    if ended {
        announce_end(state, room, reason);
    }
    Ok(ended)
}

/// Deadline of the round started at `started_at_ms`. Only fires if that round is
/// still the one recorded in the store.
async fn expire_round(
    state: &SharedState,
    room: &RoomCode,
    started_at_ms: u64,
) -> Result<bool, ServiceError> {
    let store = state.require_store().await?;
    if !store.end_session_if(room, started_at_ms).await? {
        debug!(room = %room, started_at_ms, "round already ended before its deadline");
        return Ok(false);
    }
    // The caller is the round's own timer task, so its handle is detached, not aborted.
    drop(
        state
            .rounds()
            .end_running(room, EndReason::TimeUp, started_at_ms),
    );
    announce_end(state, room, EndReason::TimeUp);
    Ok(true)
}

fn announce_end(state: &SharedState, room: &RoomCode, reason: EndReason) {
    state.active_rooms().remove(room);
    state
        .hub()
        .broadcast(room, &ServerMessage::TestEnded { reason });
    info!(room = %room, reason = ?reason, "round ended");
}

async fn ensure_leader(
    store: &RoomStore,
    room: &RoomCode,
    user_id: &str,
) -> Result<(), ServiceError> {
    match store.leader(room).await? {
        Some(leader) if leader == user_id => Ok(()),
        _ => Err(ServiceError::NotAuthorized(format!(
            "`{user_id}` is not the leader of room `{room}`"
        ))),
    }
}

/// Countdown, launch and deadline of one round.
async fn run_round(state: SharedState, room: RoomCode, generation: u64) {
    let round = state.config().round();

    let mut remaining = round.countdown_ticks;
    while remaining > 1 {
        sleep(COUNTDOWN_TICK).await;
        match state
            .rounds()
            .advance(&room, generation, SessionEvent::Tick)
        {
            Some(SessionPhase::Countdown { remaining: next }) => {
                remaining = next;
                state
                    .hub()
                    .broadcast(&room, &ServerMessage::CountdownUpdate { countdown: next });
            }
            _ => return,
        }
    }
    if round.countdown_ticks > 0 {
        sleep(COUNTDOWN_TICK).await;
    }

    let Some(started_at_ms) = launch(&state, &room, generation).await else {
        return;
    };
    sleep(round.duration + round.end_guard).await;
    if let Err(err) = expire_round(&state, &room, started_at_ms).await {
        warn!(room = %room, error = %err, "failed to end round at deadline");
    }
}

async fn launch(state: &SharedState, room: &RoomCode, generation: u64) -> Option<u64> {
    let started_at_ms = state.now_ms();
    state
        .rounds()
        .advance(room, generation, SessionEvent::Launch { started_at_ms })?;

    let recorded = match state.require_store().await {
        Ok(store) => store
            .begin_session(room, started_at_ms)
            .await
            .map_err(ServiceError::from),
        Err(err) => Err(err),
    };
    if let Err(err) = recorded {
        warn!(room = %room, error = %err, "failed to record round start; abandoning round");
        drop(
            state
                .rounds()
                .end_running(room, EndReason::ManualEnd, started_at_ms),
        );
        state.active_rooms().remove(room);
        state.hub().broadcast(
            room,
            &ServerMessage::Error {
                message: "Failed to start test".into(),
            },
        );
        return None;
    }

    state.active_rooms().add(room);
    state
        .hub()
        .broadcast(room, &ServerMessage::TestStarted { start_time: started_at_ms });
    info!(room = %room, started_at_ms, "round started");
    Some(started_at_ms)
}

/// Re-arm the deadline of every round found running in the store.
///
/// Used at startup, so rounds started before a restart still end on time. Session
/// keys whose room is gone are removed.
pub async fn recover_sessions(state: &SharedState) -> Result<usize, ServiceError> {
    let store = state.require_store().await?;
    let round = state.config().round();
    let mut recovered = 0;

    for room in store.session_rooms().await? {
        let Some(started_at_ms) = store.session_start(&room).await? else {
            continue;
        };
        if !store.room_exists(&room).await? {
            store.take_session(&room).await?;
            debug!(room = %room, "dropped session of vanished room");
            continue;
        }

        let generation = state.rounds().begin(&room, 0);
        state
            .rounds()
            .advance(&room, generation, SessionEvent::Launch { started_at_ms });
        state.active_rooms().add(&room);

        let deadline_ms =
            started_at_ms.saturating_add((round.duration + round.end_guard).as_millis() as u64);
        let delay = Duration::from_millis(deadline_ms.saturating_sub(state.now_ms()));
        let task = tokio::spawn({
            let state = state.clone();
            let room = room.clone();
            async move {
                sleep(delay).await;
                if let Err(err) = expire_round(&state, &room, started_at_ms).await {
                    warn!(room = %room, error = %err, "failed to end recovered round");
                }
            }
        });
        state.rounds().attach(&room, generation, task);
        recovered += 1;
    }

    if recovered > 0 {
        info!(recovered, "re-armed running rounds");
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::kv_store::{KvStore, testing::TestStore},
        services::room_service,
        state::{AppState, hub::ClientConnection},
    };

    async fn setup() -> (SharedState, RoomCode, Uuid, mpsc::UnboundedReceiver<Message>) {
        setup_over(Arc::new(TestStore::new())).await
    }

    async fn setup_over(
        kv: Arc<dyn KvStore>,
    ) -> (SharedState, RoomCode, Uuid, mpsc::UnboundedReceiver<Message>) {
        let state = AppState::with_store(AppConfig::default(), kv).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        state.hub().register(ClientConnection { id, tx });
        let room = RoomCode::parse("R1").unwrap();
        room_service::create_room(&state, id, &room, "u1", "one")
            .await
            .unwrap();
        (state, room, id, rx)
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(text.as_str()).unwrap());
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn non_leader_cannot_start() {
        let (state, room, _id, _rx) = setup().await;
        let err = start_test(&state, &room, "u2").await.unwrap_err();
        assert!(err.is_silent());
        assert_eq!(state.rounds().phase(&room), SessionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_end_during_countdown_stops_it() {
        let (state, room, id, mut rx) = setup().await;
        start_test(&state, &room, "u1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        end_test(&state, id, &room, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let names: Vec<_> = events(&mut rx)
            .into_iter()
            .map(|event| event["event"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"testEnded".to_string()));
        assert!(!names.contains(&"testStarted".to_string()));
        assert!(!state.active_rooms().contains(&room));
        let store = state.store().await.unwrap();
        assert!(store.session_start(&room).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_round_ends_at_remaining_deadline() {
        let (state, room, _id, mut rx) = setup().await;
        let store = state.store().await.unwrap();
        let started_at_ms = state.now_ms() - 100_000;
        store.begin_session(&room, started_at_ms).await.unwrap();

        assert_eq!(recover_sessions(&state).await.unwrap(), 1);
        assert!(state.active_rooms().contains(&room));
        events(&mut rx);

        tokio::time::sleep(Duration::from_secs(41)).await;
        assert!(events(&mut rx).is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        let ended: Vec<_> = events(&mut rx)
            .into_iter()
            .filter(|event| event["event"] == "testEnded")
            .collect();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0]["data"]["reason"], "time_up");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reset_starts_nothing() {
        let kv = TestStore::new();
        let (state, room, _id, mut rx) = setup_over(Arc::new(kv.clone())).await;
        events(&mut rx);

        kv.fail_writes(true);
        let err = start_test(&state, &room, "u1").await.unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(events(&mut rx).is_empty());
        assert_eq!(state.rounds().phase(&room), SessionPhase::Idle);
        assert!(!state.active_rooms().contains(&room));
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_start_time_does_not_overflow_recovery() {
        let (state, room, _id, _rx) = setup().await;
        let store = state.store().await.unwrap();
        store.begin_session(&room, u64::MAX - 1).await.unwrap();

        assert_eq!(recover_sessions(&state).await.unwrap(), 1);
        assert!(state.active_rooms().contains(&room));
    }
}

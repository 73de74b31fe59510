//! Periodic, server-authoritative round clock broadcast.
//!
//! Remaining time is always derived from the start timestamp in the store, never
//! accumulated, so a client that misses ticks converges on the next one.

use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::room_store::RoomStore,
    dto::ws::{ServerMessage, TimerSyncView},
    error::ServiceError,
    state::{SharedState, clock::elapsed_secs, room::RoomCode},
};

/// Round clock as seen at `now_ms`.
///
/// Without a session the full duration is reported as not running.
pub fn timer_snapshot(started_at_ms: Option<u64>, now_ms: u64, duration: Duration) -> TimerSyncView {
    let total = duration.as_secs();
    match started_at_ms {
        Some(started_at_ms) => {
            let remaining = total.saturating_sub(elapsed_secs(started_at_ms, now_ms));
            TimerSyncView {
                remaining,
                running: remaining > 0,
                server_time: now_ms,
            }
        }
        None => TimerSyncView {
            remaining: total,
            running: false,
            server_time: now_ms,
        },
    }
}

/// Drop registry entries whose room or session is gone, returning the survivors.
///
/// A room whose liveness cannot be read is pruned as well.
pub async fn reconcile(state: &SharedState, store: &RoomStore) -> Vec<RoomCode> {
    let mut survivors = Vec::new();
    for room in state.active_rooms().snapshot() {
        match store.session_liveness(&room).await {
            Ok(liveness) if liveness.is_live() => survivors.push(room),
            Ok(_) => {
                state.active_rooms().remove(&room);
            }
            Err(err) => {
                warn!(room = %room, error = %err, "failed to check room liveness; pruning");
                state.active_rooms().remove(&room);
            }
        }
    }
    survivors
}

/// One timer sync tick: reconcile, then broadcast the clock of every live room.
pub async fn sync_active_rooms(state: &SharedState) {
    if state.active_rooms().is_empty() {
        return;
    }
    let Ok(store) = state.require_store().await else {
        debug!("skipping timer sync in degraded mode");
        return;
    };

    let rooms = reconcile(state, &store).await;
    let duration = state.config().round().duration;
    for room in rooms {
        match store.session_start(&room).await {
            Ok(Some(started_at_ms)) => {
                let view = timer_snapshot(Some(started_at_ms), state.now_ms(), duration);
                if view.remaining > 0 {
                    state.hub().broadcast(&room, &ServerMessage::TimerSync(view));
                } else {
                    // The round's own deadline announces the end.
                    state.active_rooms().remove(&room);
                }
            }
            Ok(None) => {
                state.active_rooms().remove(&room);
            }
            Err(err) => {
                warn!(room = %room, error = %err, "timer sync failed; pruning room");
                state.active_rooms().remove(&room);
            }
        }
    }
}

/// Answer a client's on-demand sync request on its own connection.
pub async fn get_timer_sync(
    state: &SharedState,
    connection: Uuid,
    room: &RoomCode,
) -> Result<(), ServiceError> {
    let store = state.require_store().await?;
    let started_at_ms = store.session_start(room).await?;
    if started_at_ms.is_none() && !store.room_exists(room).await? {
        return Err(ServiceError::RoomNotFound(room.clone()));
    }

    let view = timer_snapshot(started_at_ms, state.now_ms(), state.config().round().duration);
    let _ = state.hub().send(connection, &ServerMessage::TimerSync(view));
    Ok(())
}

/// Drive the timer sync loop forever.
pub async fn run(state: SharedState) {
    let mut ticker = interval(state.config().sync().period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        sync_active_rooms(&state).await;
    }
}

/// Reconcile the active room registry on a slow cadence, independently of the sync loop.
pub async fn run_cleanup(state: SharedState) {
    let mut ticker = interval(state.config().sync().cleanup_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match state.require_store().await {
            Ok(store) => {
                reconcile(&state, &store).await;
                info!(active = state.active_rooms().len(), "active rooms cleanup completed");
            }
            Err(_) => debug!("skipping active room cleanup in degraded mode"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::kv_store::{memory::MemoryStore, testing::TestStore},
        services::room_service,
        state::{AppState, hub::ClientConnection},
    };

    async fn subscribed_room(
        kv: TestStore,
    ) -> (SharedState, RoomCode, mpsc::UnboundedReceiver<Message>) {
        let state = AppState::with_store(AppConfig::default(), Arc::new(kv)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        state.hub().register(ClientConnection { id, tx });
        let room = RoomCode::parse("R1").unwrap();
        room_service::create_room(&state, id, &room, "u1", "one")
            .await
            .unwrap();
        while rx.try_recv().is_ok() {}
        (state, room, rx)
    }

    const DURATION: Duration = Duration::from_secs(140);

    #[test]
    fn idle_room_reports_full_duration() {
        let view = timer_snapshot(None, 5_000, DURATION);
        assert_eq!(
            view,
            TimerSyncView {
                remaining: 140,
                running: false,
                server_time: 5_000
            }
        );
    }

    #[test]
    fn remaining_is_derived_from_start() {
        let view = timer_snapshot(Some(1_000), 11_000, DURATION);
        assert_eq!(view.remaining, 130);
        assert!(view.running);

        let over = timer_snapshot(Some(0), 200_000, DURATION);
        assert_eq!(over.remaining, 0);
        assert!(!over.running);
    }

    #[tokio::test]
    async fn reconcile_prunes_rooms_without_session() {
        let state = AppState::with_store(AppConfig::default(), Arc::new(MemoryStore::new())).await;
        let store = state.store().await.unwrap();
        let live = RoomCode::parse("live").unwrap();
        let stale = RoomCode::parse("stale").unwrap();
        let leader = crate::state::room::PlayerRecord::new("one", true);
        store.create_room(&live, "u1", &leader, Uuid::new_v4()).await.unwrap();
        store.create_room(&stale, "u1", &leader, Uuid::new_v4()).await.unwrap();
        store.begin_session(&live, 1).await.unwrap();
        state.active_rooms().add(&live);
        state.active_rooms().add(&stale);

        let survivors = reconcile(&state, &store).await;
        assert_eq!(survivors, vec![live.clone()]);
        assert!(state.active_rooms().contains(&live));
        assert!(!state.active_rooms().contains(&stale));
    }

    #[tokio::test]
    async fn sync_prunes_rooms_it_cannot_read() {
        let kv = TestStore::new();
        let (state, room, mut rx) = subscribed_room(kv.clone()).await;
        let store = state.store().await.unwrap();
        store.begin_session(&room, state.now_ms()).await.unwrap();
        state.active_rooms().add(&room);

        kv.fail_reads(true);
        sync_active_rooms(&state).await;
        assert!(!state.active_rooms().contains(&room));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_clock_is_pruned_without_announcing_the_end() {
        let (state, room, mut rx) = subscribed_room(TestStore::new()).await;
        let store = state.store().await.unwrap();
        let started_at_ms = state.now_ms() - DURATION.as_millis() as u64 - 1_000;
        store.begin_session(&room, started_at_ms).await.unwrap();
        state.active_rooms().add(&room);

        sync_active_rooms(&state).await;
        assert!(!state.active_rooms().contains(&room));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn running_rooms_receive_the_clock() {
        let (state, room, mut rx) = subscribed_room(TestStore::new()).await;
        let store = state.store().await.unwrap();
        store.begin_session(&room, state.now_ms()).await.unwrap();
        state.active_rooms().add(&room);

        sync_active_rooms(&state).await;
        assert!(state.active_rooms().contains(&room));
        let Ok(Message::Text(text)) = rx.try_recv() else {
            panic!("expected a timer sync");
        };
        let event: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(event["event"], "timerSync");
    }
}

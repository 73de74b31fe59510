use std::time::SystemTime;

use tracing::warn;

use crate::{
    dto::{format_system_time, health::HealthResponse},
    state::SharedState,
};

/// Report the degraded flag and the active room count while logging storage issues.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.require_store().await {
        Ok(store) => {
            if let Err(err) = store.health_check().await {
                warn!(error = %err, "storage health check failed");
            }
        }
        Err(_) => warn!("storage unavailable (degraded mode)"),
    }

    let active_rooms = state.active_rooms().len();
    let timestamp = format_system_time(SystemTime::now());
    if state.is_degraded() {
        HealthResponse::degraded(active_rooms, timestamp)
    } else {
        HealthResponse::ok(active_rooms, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::kv_store::memory::MemoryStore,
        state::{AppState, room::RoomCode},
    };

    #[tokio::test]
    async fn reports_degraded_until_store_installed() {
        let state = AppState::new(AppConfig::default());
        assert_eq!(health_status(&state).await.status, "degraded");

        state.install_store(Arc::new(MemoryStore::new())).await;
        state.active_rooms().add(&RoomCode::parse("r1").unwrap());
        let status = health_status(&state).await;
        assert_eq!(status.status, "ok");
        assert_eq!(status.active_rooms, 1);
        assert!(status.timestamp.contains('T'));
    }
}

use serde::Serialize;
use utoipa::ToSchema;

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Rooms currently driven by the timer sync loop.
    pub active_rooms: usize,
    /// RFC 3339 time the response was produced.
    pub timestamp: String,
}

impl HealthResponse {
    /// Create a health response indicating the system is operational.
    pub fn ok(active_rooms: usize, timestamp: String) -> Self {
        Self {
            status: "ok".to_string(),
            active_rooms,
            timestamp,
        }
    }

    /// Create a health response indicating the system is in degraded mode.
    pub fn degraded(active_rooms: usize, timestamp: String) -> Self {
        Self {
            status: "degraded".to_string(),
            active_rooms,
            timestamp,
        }
    }
}

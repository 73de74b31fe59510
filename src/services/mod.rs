/// Chat log: posting and retained history.
pub mod chat_service;
/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Room registry: create, join, leave and disconnect.
pub mod room_service;
/// Round lifecycle: countdown, launch and end.
pub mod session_service;
/// Live stats ingestion, leaderboard and final results.
pub mod stats_service;
/// Storage backend supervision and degraded mode.
pub mod storage_supervisor;
/// Periodic round clock broadcast and active room reconciliation.
pub mod timer_sync;
/// WebSocket connection and message handling service.
pub mod websocket_service;

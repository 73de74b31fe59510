use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Wall clock anchored once at startup and advanced by the monotonic Tokio clock.
///
/// Readings never go backwards even if the system clock is adjusted, and tests
/// running with paused time observe exactly the time they advance.
#[derive(Debug, Clone, Copy)]
pub struct ServerClock {
    origin_ms: u64,
    origin: Instant,
}

impl ServerClock {
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_millis() as u64)
            .unwrap_or_default();
        Self {
            origin_ms,
            origin: Instant::now(),
        }
    }

    /// Current time in milliseconds since the Unix epoch.
    pub fn now_ms(&self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Whole seconds elapsed between two epoch-millisecond instants.
pub fn elapsed_secs(started_at_ms: u64, now_ms: u64) -> u64 {
    now_ms.saturating_sub(started_at_ms) / 1_000
}

//! Application-level configuration loading: round timings, sync cadence and store limits.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "KEYFURY_CONFIG_PATH";

const DEFAULT_ROUND_DURATION: Duration = Duration::from_secs(140);
const DEFAULT_COUNTDOWN_TICKS: u32 = 5;
const DEFAULT_END_GUARD: Duration = Duration::from_secs(2);
const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(2);
const DEFAULT_CLEANUP_PERIOD: Duration = Duration::from_secs(5 * 60);
const DEFAULT_ROOM_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_CONNECTION_TTL: Duration = Duration::from_secs(25 * 60);
const DEFAULT_CHAT_TTL: Duration = Duration::from_secs(20 * 60);
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(20 * 60);
const DEFAULT_CHAT_CAP: usize = 50;

/// Length of one countdown tick.
pub const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Timing of a single round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundConfig {
    /// Fixed length of a running round.
    pub duration: Duration,
    /// Number of one-second ticks before the round starts.
    pub countdown_ticks: u32,
    /// Slack added to the server deadline so late client signals do not race it.
    pub end_guard: Duration,
}

/// Cadence of the background timer tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Period of the timer sync broadcast.
    pub period: Duration,
    /// Period of the standalone registry reconciliation sweep.
    pub cleanup_period: Duration,
}

/// Expiry and retention applied to room-scoped keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub room_ttl: Duration,
    pub connection_ttl: Duration,
    pub chat_ttl: Duration,
    pub session_ttl: Duration,
    /// Number of chat messages kept per room.
    pub chat_cap: usize,
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    round: RoundConfig,
    sync: SyncConfig,
    limits: StoreLimits,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        duration_secs = app_config.round.duration.as_secs(),
                        "loaded configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    pub fn round(&self) -> RoundConfig {
        self.round
    }

    pub fn sync(&self) -> SyncConfig {
        self.sync
    }

    pub fn store_limits(&self) -> StoreLimits {
        self.limits
    }

    /// Override the round timing, keeping everything else.
    pub fn with_round(mut self, round: RoundConfig) -> Self {
        self.round = round;
        self
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    round_duration_secs: Option<Duration>,
    countdown_ticks: Option<u32>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    end_guard_secs: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    sync_period_secs: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    cleanup_period_secs: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    room_ttl_secs: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    connection_ttl_secs: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    chat_ttl_secs: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    session_ttl_secs: Option<Duration>,
    chat_cap: Option<usize>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        // A zero period would make the tokio interval panic.
        let non_zero = |value: Option<Duration>, fallback: Duration| {
            value.filter(|d| !d.is_zero()).unwrap_or(fallback)
        };

        Self {
            round: RoundConfig {
                duration: non_zero(value.round_duration_secs, DEFAULT_ROUND_DURATION),
                countdown_ticks: value.countdown_ticks.unwrap_or(DEFAULT_COUNTDOWN_TICKS),
                end_guard: value.end_guard_secs.unwrap_or(DEFAULT_END_GUARD),
            },
            sync: SyncConfig {
                period: non_zero(value.sync_period_secs, DEFAULT_SYNC_PERIOD),
                cleanup_period: non_zero(value.cleanup_period_secs, DEFAULT_CLEANUP_PERIOD),
            },
            limits: StoreLimits {
                room_ttl: non_zero(value.room_ttl_secs, DEFAULT_ROOM_TTL),
                connection_ttl: non_zero(value.connection_ttl_secs, DEFAULT_CONNECTION_TTL),
                chat_ttl: non_zero(value.chat_ttl_secs, DEFAULT_CHAT_TTL),
                session_ttl: non_zero(value.session_ttl_secs, DEFAULT_SESSION_TTL),
                chat_cap: value.chat_cap.unwrap_or(DEFAULT_CHAT_CAP),
            },
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_race_rules() {
        let config = AppConfig::default();
        assert_eq!(config.round().duration, Duration::from_secs(140));
        assert_eq!(config.round().countdown_ticks, 5);
        assert_eq!(config.round().end_guard, Duration::from_secs(2));
        assert_eq!(config.sync().period, Duration::from_secs(2));
        assert_eq!(config.store_limits().chat_cap, 50);
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let raw: RawConfig =
            serde_json::from_str(r#"{"roundDurationSecs": 60, "chatCap": 10, "syncPeriodSecs": 0}"#)
                .unwrap();
        let config = AppConfig::from(raw);
        assert_eq!(config.round().duration, Duration::from_secs(60));
        assert_eq!(config.store_limits().chat_cap, 10);
        assert_eq!(config.sync().period, DEFAULT_SYNC_PERIOD);
        assert_eq!(config.store_limits().room_ttl, DEFAULT_ROOM_TTL);
    }
}

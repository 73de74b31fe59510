use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Phases a room's round moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No round is running; membership is retained.
    Idle,
    /// Countdown in progress with `remaining` ticks left to display.
    Countdown {
        /// Ticks still to be shown, the current one included.
        remaining: u32,
    },
    /// Round running since `started_at_ms` (milliseconds since the Unix epoch).
    Running {
        /// Canonical start instant of the round.
        started_at_ms: u64,
    },
}

/// Why a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The server deadline elapsed.
    TimeUp,
    /// Every player in the room finished.
    AllFinished,
    /// The leader forced the end.
    ManualEnd,
}

/// Events that can be applied to a [`RoomSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Leader starts a new round with the given countdown length.
    Start {
        /// Number of countdown ticks.
        countdown: u32,
    },
    /// One countdown second elapsed.
    Tick,
    /// Countdown reached zero and the start instant was recorded.
    Launch {
        /// Start instant written to the store.
        started_at_ms: u64,
    },
    /// The round ended.
    End(EndReason),
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the session was in when the invalid event was received.
    pub from: SessionPhase,
    /// The event that cannot be applied from this phase.
    pub event: SessionEvent,
}

/// Round lifecycle of a single room.
///
/// `generation` increases on every `Start`, so work scheduled for an earlier round
/// can tell it has been superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSession {
    phase: SessionPhase,
    generation: u64,
}

impl Default for RoomSession {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            generation: 0,
        }
    }
}

impl RoomSession {
    /// Create a session in the idle phase.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Generation of the current (or last) round.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Apply `event`, returning the new phase.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionPhase, InvalidTransition> {
        let next = self.compute_transition(event)?;
        if matches!(event, SessionEvent::Start { .. }) {
            self.generation += 1;
        }
        self.phase = next;
        Ok(next)
    }

    fn compute_transition(&self, event: SessionEvent) -> Result<SessionPhase, InvalidTransition> {
        let next = match (self.phase, event) {
            // Restarting early is allowed from any phase; the previous round is discarded.
            (_, SessionEvent::Start { countdown }) => SessionPhase::Countdown {
                remaining: countdown,
            },
            (SessionPhase::Countdown { remaining }, SessionEvent::Tick) if remaining > 1 => {
                SessionPhase::Countdown {
                    remaining: remaining - 1,
                }
            }
            (SessionPhase::Countdown { .. }, SessionEvent::Launch { started_at_ms }) => {
                SessionPhase::Running { started_at_ms }
            }
            (SessionPhase::Running { .. }, SessionEvent::End(_)) => SessionPhase::Idle,
            (SessionPhase::Countdown { .. }, SessionEvent::End(EndReason::ManualEnd)) => {
                SessionPhase::Idle
            }
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}

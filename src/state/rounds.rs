use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::state::{
    room::RoomCode,
    session::{EndReason, RoomSession, SessionEvent, SessionPhase},
};

#[derive(Default)]
struct RoundEntry {
    session: RoomSession,
    task: Option<JoinHandle<()>>,
}

/// A round removed from the scheduler, holding its timer task if one was attached.
#[derive(Debug)]
pub struct EndedRound {
    pub task: Option<JoinHandle<()>>,
}

impl EndedRound {
    /// Cancel the round's timer task.
    pub fn abort(self) {
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

/// Per-room round lifecycles and the single timer task driving each of them.
///
/// The countdown and the end-of-round deadline of a room run in one task. Starting
/// a new round or cancelling the room aborts it, and every step the task takes is
/// checked against the generation it was spawned for.
#[derive(Default)]
pub struct RoundScheduler {
    rounds: DashMap<RoomCode, RoundEntry>,
}

impl RoundScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the countdown of a new round, aborting any task left by a previous one.
    pub fn begin(&self, room: &RoomCode, countdown: u32) -> u64 {
        let mut entry = self.rounds.entry(room.clone()).or_default();
        if let Some(task) = entry.task.take() {
            debug!(room = %room, "aborting timer of superseded round");
            task.abort();
        }
        if let Err(err) = entry.session.apply(SessionEvent::Start { countdown }) {
            warn!(room = %room, error = %err, "failed to start round");
        }
        entry.session.generation()
    }

    /// Hand the round's timer task to the scheduler.
    ///
    /// A task spawned for a round that has already been superseded or cancelled is
    /// aborted immediately.
    pub fn attach(&self, room: &RoomCode, generation: u64, task: JoinHandle<()>) {
        match self.rounds.get_mut(room) {
            Some(mut entry) if entry.session.generation() == generation => {
                entry.task = Some(task);
            }
            _ => task.abort(),
        }
    }

    /// Apply a timer event if `generation` is still the room's current round.
    pub fn advance(
        &self,
        room: &RoomCode,
        generation: u64,
        event: SessionEvent,
    ) -> Option<SessionPhase> {
        let mut entry = self.rounds.get_mut(room)?;
        if entry.session.generation() != generation {
            return None;
        }
        match entry.session.apply(event) {
            Ok(phase) => Some(phase),
            Err(err) => {
                debug!(room = %room, error = %err, "ignoring timer event");
                None
            }
        }
    }

    /// End the round running since `started_at_ms`.
    ///
    /// Returns `None` when the room is not running that round, e.g. because a
    /// newer round already replaced it.
    pub fn end_running(
        &self,
        room: &RoomCode,
        reason: EndReason,
        started_at_ms: u64,
    ) -> Option<EndedRound> {
        let mut entry = self.rounds.get_mut(room)?;
        if entry.session.phase() != (SessionPhase::Running { started_at_ms }) {
            return None;
        }
        entry.session.apply(SessionEvent::End(reason)).ok()?;
        Some(EndedRound {
            task: entry.task.take(),
        })
    }

    /// Stop a countdown in progress on behalf of the leader.
    pub fn cancel_countdown(&self, room: &RoomCode) -> Option<EndedRound> {
        let mut entry = self.rounds.get_mut(room)?;
        if !matches!(entry.session.phase(), SessionPhase::Countdown { .. }) {
            return None;
        }
        entry
            .session
            .apply(SessionEvent::End(EndReason::ManualEnd))
            .ok()?;
        Some(EndedRound {
            task: entry.task.take(),
        })
    }

    /// Return a round that failed to launch to idle.
    ///
    /// Only acts while `generation` is still in its countdown. The timer task, if
    /// any, is detached rather than aborted since it is usually the caller.
    pub fn abandon(&self, room: &RoomCode, generation: u64) -> bool {
        let Some(mut entry) = self.rounds.get_mut(room) else {
            return false;
        };
        if entry.session.generation() != generation
            || !matches!(entry.session.phase(), SessionPhase::Countdown { .. })
        {
            return false;
        }
        entry.task = None;
        entry
            .session
            .apply(SessionEvent::End(EndReason::ManualEnd))
            .is_ok()
    }

    /// Forget a deleted room, aborting its timer task.
    ///
    /// `generation` is the one observed before the room was deleted. Nothing is
    /// touched, and `false` returned, when a newer round has begun since, which means
    /// the code already belongs to a new room.
    pub fn retire(&self, room: &RoomCode, generation: Option<u64>) -> bool {
        let Some(observed) = generation else {
            return !self.rounds.contains_key(room);
        };
        match self
            .rounds
            .remove_if(room, |_, entry| entry.session.generation() == observed)
        {
            Some((_, entry)) => {
                if let Some(task) = entry.task {
                    debug!(room = %room, "aborting timer of deleted room");
                    task.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn phase(&self, room: &RoomCode) -> SessionPhase {
        self.rounds
            .get(room)
            .map_or(SessionPhase::Idle, |entry| entry.session.phase())
    }

    pub fn generation(&self, room: &RoomCode) -> Option<u64> {
        self.rounds.get(room).map(|entry| entry.session.generation())
    }
}

use std::time::Duration;

use thiserror::Error;

use crate::{
    config::GameConfig,
    services::clock_sync::Millis,
    state::game::{
        BuzzSubmission, GamePhase, GameSnapshot, Participant, ParticipantId, determine_winner,
    },
};

/// Timers owned by the game runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameTimer {
    /// One countdown tick.
    Countdown,
    /// Deadline of the buzz window.
    BuzzWindow,
}

impl GameTimer {
    /// Scheduler id of the timer.
    pub fn id(self) -> &'static str {
        match self {
            GameTimer::Countdown => "countdown",
            GameTimer::BuzzWindow => "buzz-window",
        }
    }
}

/// Events that can be applied to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    /// A participant announced itself over its open channel.
    ParticipantJoined {
        /// Connection id of the participant.
        id: ParticipantId,
        /// Announced display name.
        name: String,
    },
    /// The channel to a participant went away.
    ParticipantLeft {
        /// Connection id of the participant.
        id: ParticipantId,
    },
    /// A participant reported its current clock offset.
    ClockSynced {
        /// Connection id of the participant.
        id: ParticipantId,
        /// Reported offset.
        offset_ms: Millis,
    },
    /// The host asked to start a round.
    StartGame,
    /// A participant pressed its buzzer.
    Buzz {
        /// Who buzzed.
        participant_id: ParticipantId,
        /// Participant-local press time.
        timestamp: Millis,
        /// Offset the participant applied.
        offset_ms: Millis,
    },
    /// A game timer elapsed.
    TimerFired(GameTimer),
    /// Return to the lobby.
    Reset,
}

/// One-shot messages broadcast to every participant.
#[derive(Debug, Clone, PartialEq)]
pub enum Announcement {
    /// Countdown has begun.
    GameStarted,
    /// The game went back to the lobby.
    GameReset,
    /// A winner was decided.
    WinnerDetermined {
        /// Winning participant.
        winner_id: ParticipantId,
        /// Its display name.
        winner_name: String,
    },
}

/// Side effects produced by a transition, executed in order by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send the full snapshot to every participant.
    BroadcastSnapshot(GameSnapshot),
    /// Send an announcement to every participant.
    Announce(Announcement),
    /// Ask a participant to start sampling its clock offset.
    RequestClockSync {
        /// Target participant.
        participant_id: ParticipantId,
    },
    /// Stop any pending clock-sync work for a departed participant.
    CancelClockSync {
        /// Departed participant.
        participant_id: ParticipantId,
    },
    /// Arm (or re-arm) a game timer.
    ArmTimer {
        /// Which timer.
        timer: GameTimer,
        /// Delay before it fires.
        delay: Duration,
    },
    /// Disarm a game timer.
    CancelTimer(GameTimer),
}

/// Reasons an event leaves the state untouched. None of these are failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IgnoredEvent {
    /// Start requested with too few participants.
    #[error("start needs {required} participants, {present} present")]
    NotEnoughParticipants {
        /// Configured minimum.
        required: usize,
        /// Participants currently known.
        present: usize,
    },
    /// Start requested outside the lobby.
    #[error("start requested while in {0:?}")]
    AlreadyStarted(GamePhase),
    /// Buzz outside the ready/buzzing phases.
    #[error("buzz received while in {0:?}")]
    OutsideBuzzWindow(GamePhase),
    /// Event about a participant the runtime does not know.
    #[error("unknown participant `{0}`")]
    UnknownParticipant(ParticipantId),
    /// Second buzz from the same participant.
    #[error("participant `{0}` already buzzed")]
    DuplicateSubmission(ParticipantId),
    /// Buzz or sync with a NaN or infinite time.
    #[error("non-finite timestamp")]
    InvalidTimestamp,
    /// A timer fired after the phase it belonged to ended.
    #[error("{timer:?} timer fired while in {phase:?}")]
    StaleTimer {
        /// Timer that fired.
        timer: GameTimer,
        /// Phase at that moment.
        phase: GamePhase,
    },
}

/// Next snapshot plus the effects needed to reach it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// State after the event.
    pub next: GameSnapshot,
    /// Effects to execute, in order.
    pub effects: Vec<Effect>,
}

/// Pure transition function: never touches timers or the network.
pub fn compute_effects(
    snapshot: &GameSnapshot,
    event: GameEvent,
    now: Millis,
    config: &GameConfig,
) -> Result<Transition, IgnoredEvent> {
    let mut next = snapshot.clone();
    let mut effects = Vec::new();

    match event {
        GameEvent::ParticipantJoined { id, name } => {
            next.participants
                .entry(id.clone())
                .and_modify(|participant| participant.display_name = name.clone())
                .or_insert_with(|| Participant::new(id.clone(), name));
            effects.push(Effect::RequestClockSync { participant_id: id });
        }
        GameEvent::ParticipantLeft { id } => {
            if next.participants.shift_remove(&id).is_none() {
                return Err(IgnoredEvent::UnknownParticipant(id));
            }
            next.buzz_submissions
                .retain(|submission| submission.participant_id != id);
            effects.push(Effect::CancelClockSync { participant_id: id });

            if next.phase == GamePhase::Buzzing {
                if next.buzz_submissions.is_empty() {
                    next.phase = GamePhase::Ready;
                } else if next.all_submitted() {
                    finish_round(&mut next, &mut effects);
                }
            }
        }
        GameEvent::ClockSynced { id, offset_ms } => {
            if !offset_ms.is_finite() {
                return Err(IgnoredEvent::InvalidTimestamp);
            }
            let participant = next
                .participants
                .get_mut(&id)
                .ok_or_else(|| IgnoredEvent::UnknownParticipant(id.clone()))?;
            participant.clock_offset_ms = offset_ms;
            participant.last_sync_at = Some(now);
        }
        GameEvent::StartGame => {
            if next.phase != GamePhase::Lobby {
                return Err(IgnoredEvent::AlreadyStarted(next.phase));
            }
            if next.participants.len() < config.min_participants {
                return Err(IgnoredEvent::NotEnoughParticipants {
                    required: config.min_participants,
                    present: next.participants.len(),
                });
            }
            next.phase = GamePhase::Countdown;
            next.countdown_value = Some(config.countdown_from);
            effects.push(Effect::Announce(Announcement::GameStarted));
            effects.push(Effect::ArmTimer {
                timer: GameTimer::Countdown,
                delay: config.countdown_tick,
            });
        }
        GameEvent::TimerFired(GameTimer::Countdown) => {
            if next.phase != GamePhase::Countdown {
                return Err(IgnoredEvent::StaleTimer {
                    timer: GameTimer::Countdown,
                    phase: next.phase,
                });
            }
            match next.countdown_value.unwrap_or_default() {
                // "0" stays visible for one full tick before the window opens.
                0 => {
                    next.phase = GamePhase::Ready;
                    next.countdown_value = None;
                    next.buzz_window_started_at = Some(now);
                    effects.push(Effect::ArmTimer {
                        timer: GameTimer::BuzzWindow,
                        delay: config.buzz_window,
                    });
                }
                value => {
                    next.countdown_value = Some(value - 1);
                    effects.push(Effect::ArmTimer {
                        timer: GameTimer::Countdown,
                        delay: config.countdown_tick,
                    });
                }
            }
        }
        GameEvent::Buzz {
            participant_id,
            timestamp,
            offset_ms,
        } => {
            if !matches!(next.phase, GamePhase::Ready | GamePhase::Buzzing) {
                return Err(IgnoredEvent::OutsideBuzzWindow(next.phase));
            }
            if !next.participants.contains_key(&participant_id) {
                return Err(IgnoredEvent::UnknownParticipant(participant_id));
            }
            if next.has_submitted(&participant_id) {
                return Err(IgnoredEvent::DuplicateSubmission(participant_id));
            }
            if !(timestamp.is_finite() && offset_ms.is_finite()) {
                return Err(IgnoredEvent::InvalidTimestamp);
            }

            next.buzz_submissions
                .push(BuzzSubmission::new(participant_id, timestamp, offset_ms));
            next.phase = GamePhase::Buzzing;
            if next.all_submitted() {
                finish_round(&mut next, &mut effects);
            }
        }
        GameEvent::TimerFired(GameTimer::BuzzWindow) => {
            if !matches!(next.phase, GamePhase::Ready | GamePhase::Buzzing) {
                return Err(IgnoredEvent::StaleTimer {
                    timer: GameTimer::BuzzWindow,
                    phase: next.phase,
                });
            }
            finish_round(&mut next, &mut effects);
        }
        GameEvent::Reset => {
            next.phase = GamePhase::Lobby;
            next.buzz_submissions.clear();
            next.winner = None;
            next.countdown_value = None;
            next.buzz_window_started_at = None;
            effects.push(Effect::CancelTimer(GameTimer::Countdown));
            effects.push(Effect::CancelTimer(GameTimer::BuzzWindow));
            effects.push(Effect::Announce(Announcement::GameReset));
        }
    }

    effects.push(Effect::BroadcastSnapshot(next.clone()));
    Ok(Transition { next, effects })
}

/// Move to the result phase and announce the winner, if anyone buzzed.
fn finish_round(next: &mut GameSnapshot, effects: &mut Vec<Effect>) {
    next.phase = GamePhase::Result;
    next.winner = determine_winner(&next.buzz_submissions).map(|s| s.participant_id.clone());
    effects.push(Effect::CancelTimer(GameTimer::BuzzWindow));

    if let Some(winner_id) = next.winner.clone() {
        let winner_name = next
            .display_name(&winner_id)
            .unwrap_or(winner_id.as_str())
            .to_string();
        effects.push(Effect::Announce(Announcement::WinnerDetermined {
            winner_id,
            winner_name,
        }));
    }
}

/// Errors that can occur when applying a planned transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// The state changed since the plan was computed.
    #[error("state version mismatch (expected {expected}, got {actual})")]
    VersionMismatch {
        /// Version the plan was computed against.
        expected: usize,
        /// Current version.
        actual: usize,
    },
}

/// A computed transition that has not been committed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Version the plan was computed from.
    pub version: usize,
    /// Computed transition.
    pub transition: Transition,
}

/// Holder of the authoritative snapshot; mutated only through planned transitions.
#[derive(Debug, Clone)]
pub struct GameStateMachine {
    snapshot: GameSnapshot,
    version: usize,
    config: GameConfig,
}

impl GameStateMachine {
    /// Create a state machine in the lobby.
    pub fn new(config: GameConfig) -> Self {
        Self {
            snapshot: GameSnapshot::default(),
            version: 0,
            config,
        }
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> GamePhase {
        self.snapshot.phase
    }

    /// Borrow the current snapshot.
    pub fn snapshot(&self) -> &GameSnapshot {
        &self.snapshot
    }

    /// Number of committed transitions.
    pub fn version(&self) -> usize {
        self.version
    }

    /// Compute the transition for `event` without committing it.
    pub fn plan(&self, event: GameEvent, now: Millis) -> Result<Plan, IgnoredEvent> {
        let transition = compute_effects(&self.snapshot, event, now, &self.config)?;
        Ok(Plan {
            version: self.version,
            transition,
        })
    }

    /// Commit a plan, returning the effects to execute.
    pub fn apply(&mut self, plan: Plan) -> Result<Vec<Effect>, ApplyError> {
        if plan.version != self.version {
            return Err(ApplyError::VersionMismatch {
                expected: plan.version,
                actual: self.version,
            });
        }
        self.snapshot = plan.transition.next;
        self.version += 1;
        Ok(plan.transition.effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GameConfig {
        GameConfig::default()
    }

    fn dispatch(sm: &mut GameStateMachine, event: GameEvent, now: Millis) -> Vec<Effect> {
        let plan = sm.plan(event, now).unwrap();
        sm.apply(plan).unwrap()
    }

    fn join(sm: &mut GameStateMachine, id: &str) {
        dispatch(
            sm,
            GameEvent::ParticipantJoined {
                id: id.into(),
                name: format!("player {id}"),
            },
            0.0,
        );
    }

    fn buzz(participant_id: &str, timestamp: Millis, offset_ms: Millis) -> GameEvent {
        GameEvent::Buzz {
            participant_id: participant_id.into(),
            timestamp,
            offset_ms,
        }
    }

    /// Lobby with two participants, driven into the ready phase.
    fn ready_machine() -> GameStateMachine {
        let mut sm = GameStateMachine::new(config());
        join(&mut sm, "p1");
        join(&mut sm, "p2");
        dispatch(&mut sm, GameEvent::StartGame, 0.0);
        for tick in 1..=4 {
            dispatch(
                &mut sm,
                GameEvent::TimerFired(GameTimer::Countdown),
                tick as f64 * 1_000.0,
            );
        }
        assert_eq!(sm.phase(), GamePhase::Ready);
        sm
    }

    #[test]
    fn initial_state_is_lobby() {
        let sm = GameStateMachine::new(config());
        assert_eq!(sm.phase(), GamePhase::Lobby);
        assert_eq!(sm.version(), 0);
    }

    #[test]
    fn join_requests_clock_sync_and_broadcasts() {
        let mut sm = GameStateMachine::new(config());
        let effects = dispatch(
            &mut sm,
            GameEvent::ParticipantJoined {
                id: "p1".into(),
                name: "Ada".into(),
            },
            0.0,
        );
        assert_eq!(
            effects[0],
            Effect::RequestClockSync {
                participant_id: "p1".into()
            }
        );
        assert!(matches!(effects.last(), Some(Effect::BroadcastSnapshot(s)) if s.participants.len() == 1));
    }

    #[test]
    fn rejoin_is_idempotent() {
        let mut sm = GameStateMachine::new(config());
        join(&mut sm, "p1");
        dispatch(
            &mut sm,
            GameEvent::ParticipantJoined {
                id: "p1".into(),
                name: "renamed".into(),
            },
            0.0,
        );
        assert_eq!(sm.snapshot().participants.len(), 1);
        assert_eq!(sm.snapshot().display_name("p1"), Some("renamed"));
    }

    #[test]
    fn start_with_one_participant_is_ignored() {
        let mut sm = GameStateMachine::new(config());
        join(&mut sm, "p1");
        let err = sm.plan(GameEvent::StartGame, 0.0).unwrap_err();
        assert_eq!(
            err,
            IgnoredEvent::NotEnoughParticipants {
                required: 2,
                present: 1
            }
        );
        assert_eq!(sm.phase(), GamePhase::Lobby);
    }

    #[test]
    fn start_arms_countdown() {
        let mut sm = GameStateMachine::new(config());
        join(&mut sm, "p1");
        join(&mut sm, "p2");
        let effects = dispatch(&mut sm, GameEvent::StartGame, 0.0);

        assert_eq!(sm.phase(), GamePhase::Countdown);
        assert_eq!(sm.snapshot().countdown_value, Some(3));
        assert_eq!(effects[0], Effect::Announce(Announcement::GameStarted));
        assert_eq!(
            effects[1],
            Effect::ArmTimer {
                timer: GameTimer::Countdown,
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn countdown_holds_zero_for_a_tick_then_opens_window() {
        let mut sm = GameStateMachine::new(config());
        join(&mut sm, "p1");
        join(&mut sm, "p2");
        dispatch(&mut sm, GameEvent::StartGame, 0.0);

        for (now, expected) in [(1_000.0, 2), (2_000.0, 1), (3_000.0, 0)] {
            let effects = dispatch(&mut sm, GameEvent::TimerFired(GameTimer::Countdown), now);
            assert_eq!(sm.phase(), GamePhase::Countdown);
            assert_eq!(sm.snapshot().countdown_value, Some(expected));
            assert!(effects.contains(&Effect::ArmTimer {
                timer: GameTimer::Countdown,
                delay: Duration::from_secs(1)
            }));
        }

        let effects = dispatch(&mut sm, GameEvent::TimerFired(GameTimer::Countdown), 4_000.0);
        assert_eq!(sm.phase(), GamePhase::Ready);
        assert_eq!(sm.snapshot().buzz_window_started_at, Some(4_000.0));
        assert_eq!(sm.snapshot().countdown_value, None);
        assert!(effects.contains(&Effect::ArmTimer {
            timer: GameTimer::BuzzWindow,
            delay: Duration::from_secs(10)
        }));
    }

    #[test]
    fn buzz_in_lobby_is_ignored() {
        let mut sm = GameStateMachine::new(config());
        join(&mut sm, "p1");
        let before = sm.snapshot().clone();
        let err = sm.plan(buzz("p1", 10.0, 0.0), 10.0).unwrap_err();
        assert_eq!(err, IgnoredEvent::OutsideBuzzWindow(GamePhase::Lobby));
        assert_eq!(sm.snapshot(), &before);
    }

    #[test]
    fn unknown_and_duplicate_buzzes_are_ignored() {
        let mut sm = ready_machine();
        assert_eq!(
            sm.plan(buzz("ghost", 1.0, 0.0), 1.0).unwrap_err(),
            IgnoredEvent::UnknownParticipant("ghost".into())
        );

        dispatch(&mut sm, buzz("p1", 5_000.0, 0.0), 5_000.0);
        assert_eq!(
            sm.plan(buzz("p1", 5_001.0, 0.0), 5_001.0).unwrap_err(),
            IgnoredEvent::DuplicateSubmission("p1".into())
        );
    }

    #[test]
    fn first_buzz_moves_to_buzzing_and_last_decides() {
        let mut sm = ready_machine();

        dispatch(&mut sm, buzz("p1", 1_000.0, 50.0), 5_000.0);
        assert_eq!(sm.phase(), GamePhase::Buzzing);

        let effects = dispatch(&mut sm, buzz("p2", 1_060.0, -20.0), 5_010.0);
        assert_eq!(sm.phase(), GamePhase::Result);
        assert_eq!(sm.snapshot().winner.as_deref(), Some("p2"));
        assert!(effects.contains(&Effect::CancelTimer(GameTimer::BuzzWindow)));
        assert!(effects.contains(&Effect::Announce(Announcement::WinnerDetermined {
            winner_id: "p2".into(),
            winner_name: "player p2".into(),
        })));
        assert!(matches!(effects.last(), Some(Effect::BroadcastSnapshot(_))));
    }

    #[test]
    fn identical_compensated_times_pick_smallest_id() {
        let mut sm = ready_machine();
        dispatch(&mut sm, buzz("p2", 1_000.0, 0.0), 5_000.0);
        dispatch(&mut sm, buzz("p1", 900.0, 100.0), 5_001.0);
        assert_eq!(sm.snapshot().winner.as_deref(), Some("p1"));
    }

    #[test]
    fn buzz_window_deadline_forces_result() {
        let mut sm = ready_machine();
        dispatch(&mut sm, buzz("p2", 1_000.0, 0.0), 5_000.0);

        dispatch(&mut sm, GameEvent::TimerFired(GameTimer::BuzzWindow), 14_000.0);
        assert_eq!(sm.phase(), GamePhase::Result);
        assert_eq!(sm.snapshot().winner.as_deref(), Some("p2"));
    }

    #[test]
    fn empty_buzz_window_ends_without_winner() {
        let mut sm = ready_machine();
        let effects = dispatch(&mut sm, GameEvent::TimerFired(GameTimer::BuzzWindow), 14_000.0);
        assert_eq!(sm.phase(), GamePhase::Result);
        assert_eq!(sm.snapshot().winner, None);
        assert!(
            !effects
                .iter()
                .any(|effect| matches!(effect, Effect::Announce(Announcement::WinnerDetermined { .. })))
        );
    }

    #[test]
    fn departure_while_buzzing_can_complete_round() {
        let mut sm = ready_machine();
        join(&mut sm, "p3");
        dispatch(&mut sm, buzz("p1", 1_000.0, 0.0), 5_000.0);
        dispatch(&mut sm, buzz("p2", 1_010.0, 0.0), 5_010.0);
        assert_eq!(sm.phase(), GamePhase::Buzzing);

        let effects = dispatch(&mut sm, GameEvent::ParticipantLeft { id: "p3".into() }, 5_020.0);
        assert_eq!(sm.phase(), GamePhase::Result);
        assert_eq!(sm.snapshot().winner.as_deref(), Some("p1"));
        assert_eq!(
            effects[0],
            Effect::CancelClockSync {
                participant_id: "p3".into()
            }
        );
    }

    #[test]
    fn only_buzzer_leaving_reopens_ready() {
        let mut sm = ready_machine();
        dispatch(&mut sm, buzz("p1", 1_000.0, 0.0), 5_000.0);
        dispatch(&mut sm, GameEvent::ParticipantLeft { id: "p1".into() }, 5_010.0);
        assert_eq!(sm.phase(), GamePhase::Ready);
        assert!(sm.snapshot().buzz_submissions.is_empty());
    }

    #[test]
    fn reset_from_any_state_returns_to_lobby() {
        let mut sm = ready_machine();
        dispatch(&mut sm, buzz("p1", 1_000.0, 0.0), 5_000.0);

        let effects = dispatch(&mut sm, GameEvent::Reset, 6_000.0);
        let snapshot = sm.snapshot();
        assert_eq!(snapshot.phase, GamePhase::Lobby);
        assert!(snapshot.buzz_submissions.is_empty());
        assert_eq!(snapshot.winner, None);
        assert_eq!(snapshot.countdown_value, None);
        assert_eq!(snapshot.buzz_window_started_at, None);
        assert_eq!(snapshot.participants.len(), 2);
        assert!(effects.contains(&Effect::CancelTimer(GameTimer::Countdown)));
        assert!(effects.contains(&Effect::CancelTimer(GameTimer::BuzzWindow)));
        assert!(effects.contains(&Effect::Announce(Announcement::GameReset)));
    }

    #[test]
    fn stale_timers_are_ignored() {
        let mut sm = GameStateMachine::new(config());
        assert_eq!(
            sm.plan(GameEvent::TimerFired(GameTimer::Countdown), 0.0)
                .unwrap_err(),
            IgnoredEvent::StaleTimer {
                timer: GameTimer::Countdown,
                phase: GamePhase::Lobby
            }
        );
        join(&mut sm, "p1");
        assert_eq!(sm.version(), 1);
    }

    #[test]
    fn clock_sync_updates_participant() {
        let mut sm = GameStateMachine::new(config());
        join(&mut sm, "p1");
        dispatch(
            &mut sm,
            GameEvent::ClockSynced {
                id: "p1".into(),
                offset_ms: -42.5,
            },
            123.0,
        );
        let participant = &sm.snapshot().participants["p1"];
        assert_eq!(participant.clock_offset_ms, -42.5);
        assert_eq!(participant.last_sync_at, Some(123.0));
    }

    #[test]
    fn stale_plan_is_rejected() {
        let mut sm = GameStateMachine::new(config());
        let plan = sm
            .plan(
                GameEvent::ParticipantJoined {
                    id: "p1".into(),
                    name: "a".into(),
                },
                0.0,
            )
            .unwrap();
        join(&mut sm, "p2");
        assert_eq!(
            sm.apply(plan).unwrap_err(),
            ApplyError::VersionMismatch {
                expected: 0,
                actual: 1
            }
        );
    }
}

//! Actor that owns the host's [`GameStateMachine`] and executes its effects.
//!
//! Events arrive on an unbounded channel and are applied one at a time.
//! Timer callbacks only enqueue events, so a timer firing while an event is
//! being handled is processed after it.

use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender},
        watch,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::{ClockSyncConfig, GameConfig},
    dto::{channel::ChannelMessage, game::GameSnapshotDto},
    services::clock_sync::{Millis, now_ms},
    state::{
        game::{GameSnapshot, ParticipantId},
        state_machine::{
            Announcement, Effect, GameEvent, GameStateMachine, GameTimer, IgnoredEvent,
        },
        timers::TimerScheduler,
    },
};

/// Recipients of an outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Every participant.
    All,
    /// A single participant.
    Participant(ParticipantId),
}

/// Message the host endpoint must put on one or more channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    /// Who receives it.
    pub target: Target,
    /// What to send.
    pub message: ChannelMessage,
}

/// Cloneable handle to a running [`GameRuntime`].
#[derive(Clone)]
pub struct GameRuntimeHandle {
    events: UnboundedSender<GameEvent>,
    snapshots: watch::Receiver<GameSnapshot>,
}

impl GameRuntimeHandle {
    /// Enqueue `event`. Returns `false` once the runtime stopped.
    pub fn send(&self, event: GameEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Latest committed snapshot.
    pub fn snapshot(&self) -> GameSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified after every committed transition.
    pub fn subscribe(&self) -> watch::Receiver<GameSnapshot> {
        self.snapshots.clone()
    }
}

/// Executor of game transitions.
pub struct GameRuntime {
    machine: GameStateMachine,
    scheduler: TimerScheduler,
    events: WeakUnboundedSender<GameEvent>,
    outbound: UnboundedSender<Outbound>,
    clock_sync: ClockSyncConfig,
    snapshots: watch::Sender<GameSnapshot>,
}

impl GameRuntime {
    /// Start the runtime task. It stops when every handle is dropped, disarming its timers.
    pub fn spawn(
        game: GameConfig,
        clock_sync: ClockSyncConfig,
        outbound: UnboundedSender<Outbound>,
    ) -> (GameRuntimeHandle, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = watch::channel(GameSnapshot::default());

        let runtime = GameRuntime {
            machine: GameStateMachine::new(game),
            scheduler: TimerScheduler::new(),
            events: events_tx.downgrade(),
            outbound,
            clock_sync,
            snapshots: snapshots_tx,
        };
        let task = tokio::spawn(runtime.run(events_rx));

        (
            GameRuntimeHandle {
                events: events_tx,
                snapshots: snapshots_rx,
            },
            task,
        )
    }

    async fn run(mut self, mut events: UnboundedReceiver<GameEvent>) {
        info!("game runtime started");
        while let Some(event) = events.recv().await {
            if let Err(ignored) = self.dispatch(event, now_ms()) {
                debug!(reason = %ignored, "game event ignored");
            }
        }
        self.scheduler.cancel_all();
        info!("game runtime stopped");
    }

    /// Plan, commit and execute one event.
    pub fn dispatch(&mut self, event: GameEvent, now: Millis) -> Result<(), IgnoredEvent> {
        let plan = self.machine.plan(event, now)?;
        match self.machine.apply(plan) {
            Ok(effects) => {
                self.apply_effects(effects);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "failed to commit game transition");
                Ok(())
            }
        }
    }

    /// Execute `effects` in order.
    pub fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::BroadcastSnapshot(snapshot) => {
                    self.emit(
                        Target::All,
                        ChannelMessage::Snapshot(GameSnapshotDto::from(&snapshot)),
                    );
                    self.snapshots.send_replace(snapshot);
                }
                Effect::Announce(announcement) => {
                    let message = match announcement {
                        Announcement::GameStarted => {
                            info!("game started");
                            ChannelMessage::GameStarted
                        }
                        Announcement::GameReset => {
                            info!("game reset");
                            ChannelMessage::GameReset
                        }
                        Announcement::WinnerDetermined {
                            winner_id,
                            winner_name,
                        } => {
                            info!(winner = %winner_id, name = %winner_name, "winner determined");
                            ChannelMessage::WinnerDetermined {
                                winner_id,
                                winner_name,
                            }
                        }
                    };
                    self.emit(Target::All, message);
                }
                Effect::RequestClockSync { participant_id } => {
                    self.start_clock_sync_burst(&participant_id);
                }
                Effect::CancelClockSync { participant_id } => {
                    let prefix = format!("clock-sync:{participant_id}:");
                    let cancelled = self.scheduler.cancel_where(|id| id.starts_with(&prefix));
                    debug!(participant = %participant_id, cancelled, "clock sync burst cancelled");
                }
                Effect::ArmTimer { timer, delay } => self.arm(timer, delay),
                Effect::CancelTimer(timer) => {
                    self.scheduler.cancel(timer.id());
                }
            }
        }
    }

    /// Current state.
    pub fn snapshot(&self) -> &GameSnapshot {
        self.machine.snapshot()
    }

    fn emit(&self, target: Target, message: ChannelMessage) {
        if self.outbound.send(Outbound { target, message }).is_err() {
            debug!("outbound channel closed; dropping game message");
        }
    }

    fn arm(&self, timer: GameTimer, delay: std::time::Duration) {
        let events = self.events.clone();
        self.scheduler.schedule(timer.id(), delay, move || {
            if let Some(events) = events.upgrade() {
                let _ = events.send(GameEvent::TimerFired(timer));
            }
        });
    }

    /// Ping now, then `burst_rounds - 1` more times spaced by `burst_spacing`.
    fn start_clock_sync_burst(&self, participant_id: &str) {
        let rounds = self.clock_sync.burst_rounds;
        if rounds == 0 {
            return;
        }
        self.emit(
            Target::Participant(participant_id.to_string()),
            ChannelMessage::ClockSyncPing {
                authoritative_time: now_ms(),
            },
        );
        for round in 1..rounds {
            let outbound = self.outbound.clone();
            let target = participant_id.to_string();
            self.scheduler.schedule(
                format!("clock-sync:{participant_id}:{round}"),
                self.clock_sync.burst_spacing * round,
                move || {
                    let _ = outbound.send(Outbound {
                        target: Target::Participant(target),
                        message: ChannelMessage::ClockSyncPing {
                            authoritative_time: now_ms(),
                        },
                    });
                },
            );
        }
        debug!(participant = %participant_id, rounds, "clock sync burst planned");
    }
}

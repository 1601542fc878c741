use tracing::{debug, warn};

use crate::{
    dto::{channel::ChannelMessage, validation::validate_display_name},
    services::{
        clock_sync::Millis,
        game_runtime::{GameRuntimeHandle, Outbound, Target},
        peer_connection::{
            ChannelState, NetworkPathState, PeerAction, PeerConnectionManager, PeerError,
        },
    },
    state::state_machine::GameEvent,
};

/// What the host does with a message received from a participant.
#[derive(Debug, Clone, PartialEq)]
pub enum HostRouting {
    /// Feed an event to the game runtime.
    Dispatch(GameEvent),
    /// Answer on the same channel.
    Reply(ChannelMessage),
    /// Drop it.
    Ignore,
}

/// Map a channel message from `peer_id` to a game event or a direct reply.
pub fn route_participant_message(peer_id: &str, message: ChannelMessage, now: Millis) -> HostRouting {
    match message {
        ChannelMessage::ParticipantJoined { name } => match validate_display_name(&name) {
            Ok(()) => HostRouting::Dispatch(GameEvent::ParticipantJoined {
                id: peer_id.to_string(),
                name: name.trim().to_string(),
            }),
            Err(err) => {
                warn!(peer = %peer_id, error = %err, "rejecting participant announcement");
                HostRouting::Ignore
            }
        },
        ChannelMessage::ParticipantBuzz { timestamp, offset } => {
            HostRouting::Dispatch(GameEvent::Buzz {
                participant_id: peer_id.to_string(),
                timestamp,
                offset_ms: offset,
            })
        }
        ChannelMessage::ClockSyncRequest { client_time } => {
            HostRouting::Reply(ChannelMessage::ClockSyncPong {
                client_time,
                authoritative_time: now,
            })
        }
        ChannelMessage::ClockSyncReport { offset, .. } => {
            HostRouting::Dispatch(GameEvent::ClockSynced {
                id: peer_id.to_string(),
                offset_ms: offset,
            })
        }
        other => {
            debug!(peer = %peer_id, kind = other.kind(), "ignoring host-bound message");
            HostRouting::Ignore
        }
    }
}

/// Host side of the direct channels: one answering connection per participant plus the game runtime.
pub struct HostEndpoint {
    peers: PeerConnectionManager,
    runtime: GameRuntimeHandle,
}

impl HostEndpoint {
    /// Host reachable on signaling connection `local_id`, driving `runtime`.
    pub fn new(local_id: &str, runtime: GameRuntimeHandle) -> Self {
        Self {
            peers: PeerConnectionManager::new(local_id, None).yielding(),
            runtime,
        }
    }

    /// Handle to the game runtime.
    pub fn runtime(&self) -> &GameRuntimeHandle {
        &self.runtime
    }

    /// Per-participant connection state.
    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    /// The session was reclaimed from the new signaling connection `local_id`.
    pub fn on_reclaimed(&mut self, local_id: &str) {
        self.peers.set_local_id(local_id);
    }

    /// The relay reported `session:peer-joined` for `peer_id`; offer `sdp` unless a connection already exists.
    ///
    /// After a reclaim this is the only way participants learn the new host id.
    /// On a first join the participant usually offers as well, and the host's
    /// connection yields to that offer.
    pub fn on_peer_joined(&mut self, peer_id: &str, sdp: String) -> Result<Vec<PeerAction>, PeerError> {
        if self.peers.peer(peer_id).is_some() {
            debug!(peer = %peer_id, "peer already negotiating; not offering");
            return Ok(Vec::new());
        }
        self.peers.connect(peer_id, sdp)
    }

    /// `signal:receive` payload from `from`.
    pub fn on_relayed(
        &mut self,
        from: &str,
        data: serde_json::Value,
    ) -> Result<Vec<PeerAction>, PeerError> {
        self.peers.handle_relayed(from, data)
    }

    /// The transport produced the answer for `peer_id`.
    pub fn local_answer(&mut self, peer_id: &str, sdp: String) -> Result<Vec<PeerAction>, PeerError> {
        self.peers.local_answer(peer_id, sdp)
    }

    /// Path state of `peer_id`. A departure removes the participant from the game.
    pub fn on_path_state(
        &mut self,
        peer_id: &str,
        state: NetworkPathState,
    ) -> Result<Vec<PeerAction>, PeerError> {
        let actions = self.peers.on_path_state(peer_id, state)?;
        self.observe(&actions);
        Ok(actions)
    }

    /// Channel state of `peer_id`. A departure removes the participant from the game.
    pub fn on_channel_state(
        &mut self,
        peer_id: &str,
        state: ChannelState,
    ) -> Result<Vec<PeerAction>, PeerError> {
        let actions = self.peers.on_channel_state(peer_id, state)?;
        self.observe(&actions);
        Ok(actions)
    }

    /// The relay reported `session:peer-left` for `peer_id`.
    pub fn on_peer_left(&mut self, peer_id: &str) -> Vec<PeerAction> {
        match self.on_path_state(peer_id, NetworkPathState::Closed) {
            Ok(actions) => actions,
            Err(err) => {
                debug!(error = %err, "peer left before negotiating");
                Vec::new()
            }
        }
    }

    /// Text frame received on the channel of `from`.
    pub fn on_channel_message(&mut self, from: &str, text: &str, now: Millis) -> Vec<PeerAction> {
        let message = match ChannelMessage::from_json_str(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(peer = %from, error = %err, "failed to parse channel message");
                return Vec::new();
            }
        };

        match route_participant_message(from, message, now) {
            HostRouting::Dispatch(event) => {
                if !self.runtime.send(event) {
                    warn!("game runtime stopped; dropping participant event");
                }
                Vec::new()
            }
            HostRouting::Reply(reply) => self.peers.send(from, reply).unwrap_or_else(|err| {
                debug!(error = %err, "reply not sent");
                Vec::new()
            }),
            HostRouting::Ignore => Vec::new(),
        }
    }

    /// Put a runtime message on the channels it targets.
    pub fn deliver(&mut self, outbound: Outbound) -> Vec<PeerAction> {
        match outbound.target {
            Target::All => self.peers.broadcast(&outbound.message),
            Target::Participant(peer_id) => self
                .peers
                .send(&peer_id, outbound.message)
                .unwrap_or_else(|err| {
                    debug!(error = %err, "targeted game message not sent");
                    Vec::new()
                }),
        }
    }

    /// Host pressed start.
    pub fn start_game(&self) -> bool {
        self.runtime.send(GameEvent::StartGame)
    }

    /// Host pressed reset.
    pub fn reset_game(&self) -> bool {
        self.runtime.send(GameEvent::Reset)
    }

    fn observe(&self, actions: &[PeerAction]) {
        for action in actions {
            if let PeerAction::Departed { peer_id } = action {
                self.runtime.send(GameEvent::ParticipantLeft {
                    id: peer_id.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        config::{ClockSyncConfig, GameConfig},
        services::{game_runtime::GameRuntime, peer_connection::PeerRole},
    };

    #[test]
    fn routes_participant_messages() {
        assert_eq!(
            route_participant_message(
                "p",
                ChannelMessage::ClockSyncRequest { client_time: 10.0 },
                500.0
            ),
            HostRouting::Reply(ChannelMessage::ClockSyncPong {
                client_time: 10.0,
                authoritative_time: 500.0
            })
        );
        assert_eq!(
            route_participant_message(
                "p",
                ChannelMessage::ParticipantBuzz {
                    timestamp: 1.0,
                    offset: 2.0
                },
                0.0
            ),
            HostRouting::Dispatch(GameEvent::Buzz {
                participant_id: "p".into(),
                timestamp: 1.0,
                offset_ms: 2.0
            })
        );
        assert_eq!(
            route_participant_message(
                "p",
                ChannelMessage::ClockSyncReport {
                    offset: -7.5,
                    synced: true
                },
                0.0
            ),
            HostRouting::Dispatch(GameEvent::ClockSynced {
                id: "p".into(),
                offset_ms: -7.5
            })
        );
        assert_eq!(
            route_participant_message("p", ChannelMessage::GameStarted, 0.0),
            HostRouting::Ignore
        );
        assert_eq!(
            route_participant_message(
                "p",
                ChannelMessage::ParticipantJoined { name: " ".into() },
                0.0
            ),
            HostRouting::Ignore
        );
    }

    #[tokio::test(start_paused = true)]
    async fn joined_participant_is_pinged_and_removed_on_failure() {
        let (tx, mut outbound) = mpsc::unbounded_channel();
        let (runtime, _task) =
            GameRuntime::spawn(GameConfig::default(), ClockSyncConfig::default(), tx);
        let mut host = HostEndpoint::new("host", runtime);

        host.on_relayed("p1", json!({"type": "offer", "sdp": "v=0"}))
            .unwrap();
        host.local_answer("p1", "answer".into()).unwrap();
        host.on_channel_state("p1", ChannelState::Open).unwrap();

        let actions = host.on_channel_message(
            "p1",
            r#"{"type":"participant-joined","name":"Ada"}"#,
            0.0,
        );
        assert!(actions.is_empty());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(host.runtime().snapshot().display_name("p1"), Some("Ada"));

        let mut transmitted = Vec::new();
        while let Ok(message) = outbound.try_recv() {
            transmitted.extend(host.deliver(message));
        }
        assert!(transmitted.iter().any(|action| matches!(
            action,
            PeerAction::Transmit {
                message: ChannelMessage::ClockSyncPing { .. },
                ..
            }
        )));

        let pong = host.on_channel_message("p1", r#"{"type":"clock-sync-request","clientTime":3}"#, 8.0);
        assert_eq!(
            pong,
            vec![PeerAction::Transmit {
                to: "p1".into(),
                message: ChannelMessage::ClockSyncPong {
                    client_time: 3.0,
                    authoritative_time: 8.0
                }
            }]
        );

        let actions = host.on_path_state("p1", NetworkPathState::Failed).unwrap();
        assert!(actions.contains(&PeerAction::Departed {
            peer_id: "p1".into()
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(host.runtime().snapshot().participants.is_empty());
        assert!(host.peers().is_empty());
    }

    #[tokio::test]
    async fn announced_peer_is_offered_once_and_answered_if_offers_cross() {
        let (tx, _outbound) = mpsc::unbounded_channel();
        let (runtime, _task) =
            GameRuntime::spawn(GameConfig::default(), ClockSyncConfig::default(), tx);
        let mut host = HostEndpoint::new("host", runtime);
        host.on_reclaimed("host-2");
        assert_eq!(host.peers().local_id(), "host-2");

        let actions = host.on_peer_joined("p1", "host-offer".into()).unwrap();
        assert!(matches!(
            &actions[..],
            [PeerAction::Relay { to, .. }] if to == "p1"
        ));
        assert!(host.on_peer_joined("p1", "again".into()).unwrap().is_empty());

        let actions = host
            .on_relayed("p1", json!({"type": "offer", "sdp": "guest-offer"}))
            .unwrap();
        assert!(matches!(actions[0], PeerAction::ApplyRemoteDescription { .. }));
        assert_eq!(host.peers().peer("p1").unwrap().role(), PeerRole::Answerer);
        host.local_answer("p1", "answer".into()).unwrap();
    }
}

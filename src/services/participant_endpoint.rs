use tracing::{debug, warn};
use validator::ValidationError;

use crate::{
    config::ClockSyncConfig,
    dto::{channel::ChannelMessage, game::GameSnapshotDto, validation::validate_display_name},
    services::clock_sync::{ClockSyncEngine, ClockSyncSample, Millis},
    state::sessions::ConnectionId,
};

/// A buzz ready to be sent to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBuzz {
    /// `participant-buzz` message.
    pub message: ChannelMessage,
    /// Whether the offset it carries is backed by enough samples. UIs warn when it is not.
    pub synced: bool,
}

/// Participant side of the direct channel: answers sync pings, tracks the host's broadcasts.
#[derive(Debug, Clone)]
pub struct ParticipantEndpoint {
    id: ConnectionId,
    display_name: String,
    clock: ClockSyncEngine,
    snapshot: Option<GameSnapshotDto>,
    winner: Option<(String, String)>,
}

impl ParticipantEndpoint {
    /// Participant on signaling connection `id`; fails if `display_name` is invalid.
    pub fn new(
        id: impl Into<ConnectionId>,
        display_name: &str,
        config: &ClockSyncConfig,
    ) -> Result<Self, ValidationError> {
        validate_display_name(display_name)?;
        Ok(Self {
            id: id.into(),
            display_name: display_name.trim().to_string(),
            clock: ClockSyncEngine::new(config),
            snapshot: None,
            winner: None,
        })
    }

    /// Message sent first when the channel to the host opens.
    pub fn announcement(&self) -> ChannelMessage {
        ChannelMessage::ParticipantJoined {
            name: self.display_name.clone(),
        }
    }

    /// Handle a message from the host, returning the replies to send back.
    pub fn on_message(&mut self, message: ChannelMessage, now: Millis) -> Vec<ChannelMessage> {
        match message {
            ChannelMessage::ClockSyncPing { .. } => {
                vec![ChannelMessage::ClockSyncRequest { client_time: now }]
            }
            ChannelMessage::ClockSyncPong {
                client_time,
                authoritative_time,
            } => match ClockSyncSample::new(client_time, authoritative_time, now) {
                Ok(sample) => {
                    let status = self.clock.record(&self.id, sample);
                    debug!(
                        offset_ms = status.offset_ms,
                        rtt_ms = sample.round_trip_time_ms,
                        samples = status.samples,
                        "clock sample recorded"
                    );
                    vec![ChannelMessage::ClockSyncReport {
                        offset: status.offset_ms,
                        synced: status.synced,
                    }]
                }
                Err(err) => {
                    warn!(error = %err, "discarding clock sample");
                    Vec::new()
                }
            },
            ChannelMessage::Snapshot(snapshot) => {
                self.snapshot = Some(snapshot);
                Vec::new()
            }
            ChannelMessage::GameStarted | ChannelMessage::GameReset => {
                self.winner = None;
                Vec::new()
            }
            ChannelMessage::WinnerDetermined {
                winner_id,
                winner_name,
            } => {
                self.winner = Some((winner_id, winner_name));
                Vec::new()
            }
            other => {
                debug!(kind = other.kind(), "ignoring participant-bound message");
                Vec::new()
            }
        }
    }

    /// Stamp a button press with the local clock and the current offset.
    pub fn buzz(&self, now: Millis) -> PreparedBuzz {
        PreparedBuzz {
            message: ChannelMessage::ParticipantBuzz {
                timestamp: now,
                offset: self.offset(),
            },
            synced: self.is_synced(),
        }
    }

    /// Current median offset to host time.
    pub fn offset(&self) -> Millis {
        self.clock.offset(&self.id)
    }

    /// Whether enough samples back the offset.
    pub fn is_synced(&self) -> bool {
        self.clock.is_synced(&self.id)
    }

    /// Last snapshot broadcast by the host.
    pub fn snapshot(&self) -> Option<&GameSnapshotDto> {
        self.snapshot.as_ref()
    }

    /// Winner id and name of the last round, until the next start or reset.
    pub fn winner(&self) -> Option<(&str, &str)> {
        self.winner
            .as_ref()
            .map(|(id, name)| (id.as_str(), name.as_str()))
    }
}

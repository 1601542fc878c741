use serde::{Deserialize, Serialize};

use crate::{dto::game::GameSnapshotDto, services::clock_sync::Millis};

/// Messages exchanged over the direct channel between a host and a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMessage {
    /// First message a participant sends once the channel is open.
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        /// Display name to show in the lobby.
        name: String,
    },
    /// Button press, in participant time, with the offset the participant applies.
    #[serde(rename_all = "camelCase")]
    ParticipantBuzz {
        /// Local press time.
        timestamp: Millis,
        /// Offset to add to reach host time.
        offset: Millis,
    },
    /// Host asks the participant to take a clock sample.
    #[serde(rename_all = "camelCase")]
    ClockSyncPing {
        /// Host clock when the ping left.
        authoritative_time: Millis,
    },
    /// Participant sample request, stamped with its local send time.
    #[serde(rename_all = "camelCase")]
    ClockSyncRequest {
        /// Participant clock when the request left.
        client_time: Millis,
    },
    /// Host answer carrying its clock reading.
    #[serde(rename_all = "camelCase")]
    ClockSyncPong {
        /// Echo of the request's `client_time`.
        client_time: Millis,
        /// Host clock when the request arrived.
        authoritative_time: Millis,
    },
    /// Participant's current median offset.
    #[serde(rename_all = "camelCase")]
    ClockSyncReport {
        /// Median offset to host time.
        offset: Millis,
        /// Whether enough samples back the offset.
        synced: bool,
    },
    /// Full game state.
    Snapshot(GameSnapshotDto),
    /// The countdown began.
    GameStarted,
    /// The host reset the round to the lobby.
    GameReset,
    /// The round is decided.
    #[serde(rename_all = "camelCase")]
    WinnerDetermined {
        /// Participant id of the winner.
        winner_id: String,
        /// Display name of the winner.
        winner_name: String,
    },
}

impl ChannelMessage {
    /// Parse a channel frame.
    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Wire tag, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMessage::ParticipantJoined { .. } => "participant-joined",
            ChannelMessage::ParticipantBuzz { .. } => "participant-buzz",
            ChannelMessage::ClockSyncPing { .. } => "clock-sync-ping",
            ChannelMessage::ClockSyncRequest { .. } => "clock-sync-request",
            ChannelMessage::ClockSyncPong { .. } => "clock-sync-pong",
            ChannelMessage::ClockSyncReport { .. } => "clock-sync-report",
            ChannelMessage::Snapshot(_) => "snapshot",
            ChannelMessage::GameStarted => "game-started",
            ChannelMessage::GameReset => "game-reset",
            ChannelMessage::WinnerDetermined { .. } => "winner-determined",
        }
    }
}

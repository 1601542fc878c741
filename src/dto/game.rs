use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    dto::phase::VisibleGamePhase,
    services::clock_sync::Millis,
    state::game::{BuzzSubmission, GameSnapshot, Participant},
};

/// Participant entry of a broadcast snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    /// Connection id of the participant.
    pub id: String,
    /// Name shown to everyone.
    pub display_name: String,
    /// Last reported offset to host time.
    pub clock_offset_ms: Millis,
    /// Host time of the last clock report.
    #[serde(default)]
    pub last_sync_at: Option<Millis>,
}

impl From<&Participant> for ParticipantSummary {
    fn from(participant: &Participant) -> Self {
        Self {
            id: participant.id.clone(),
            display_name: participant.display_name.clone(),
            clock_offset_ms: participant.clock_offset_ms,
            last_sync_at: participant.last_sync_at,
        }
    }
}

/// Buzz entry of a broadcast snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuzzSummary {
    /// Who pressed.
    pub participant_id: String,
    /// Press time on the participant's clock.
    pub local_timestamp: Millis,
    /// Offset the participant applied.
    pub offset_ms: Millis,
    /// Press time on the host clock.
    pub compensated_time: Millis,
}

impl From<&BuzzSubmission> for BuzzSummary {
    fn from(submission: &BuzzSubmission) -> Self {
        Self {
            participant_id: submission.participant_id.clone(),
            local_timestamp: submission.local_timestamp,
            offset_ms: submission.offset_ms,
            compensated_time: submission.compensated_time,
        }
    }
}

/// Full game state as broadcast by the host after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshotDto {
    /// Phase as shown to players.
    pub phase: VisibleGamePhase,
    /// Participants in join order.
    pub participants: Vec<ParticipantSummary>,
    /// Buzzes in arrival order.
    pub buzz_submissions: Vec<BuzzSummary>,
    /// Winning participant id, once decided.
    #[serde(default)]
    pub winner: Option<String>,
    /// Host time the buzz window opened.
    #[serde(default)]
    pub buzz_window_started_at: Option<Millis>,
    /// Seconds left in the countdown.
    #[serde(default)]
    pub countdown_value: Option<u32>,
}

impl From<&GameSnapshot> for GameSnapshotDto {
    fn from(snapshot: &GameSnapshot) -> Self {
        Self {
            phase: snapshot.phase.into(),
            participants: snapshot
                .participants
                .values()
                .map(ParticipantSummary::from)
                .collect(),
            buzz_submissions: snapshot
                .buzz_submissions
                .iter()
                .map(BuzzSummary::from)
                .collect(),
            winner: snapshot.winner.clone(),
            buzz_window_started_at: snapshot.buzz_window_started_at,
            countdown_value: snapshot.countdown_value,
        }
    }
}

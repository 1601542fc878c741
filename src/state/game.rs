use indexmap::IndexMap;

use crate::services::clock_sync::Millis;

/// Participants are identified by their signaling connection id.
pub type ParticipantId = String;

/// Phases of a buzz round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GamePhase {
    /// Waiting for the host to start; participants may come and go.
    #[default]
    Lobby,
    /// Counting down before the buzz window opens.
    Countdown,
    /// Buzz window open, nobody has buzzed yet.
    Ready,
    /// At least one buzz recorded, waiting for the rest.
    Buzzing,
    /// Winner decided.
    Result,
}

/// Player known to the host runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    /// Connection id of the participant.
    pub id: ParticipantId,
    /// Name announced over the direct channel.
    pub display_name: String,
    /// Last offset the participant reported.
    pub clock_offset_ms: Millis,
    /// Host time when that offset was reported.
    pub last_sync_at: Option<Millis>,
}

impl Participant {
    /// Fresh participant with no known clock offset.
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            clock_offset_ms: 0.0,
            last_sync_at: None,
        }
    }
}

/// A buzz as reported by a participant, expressed on the host clock.
#[derive(Debug, Clone, PartialEq)]
pub struct BuzzSubmission {
    /// Who buzzed.
    pub participant_id: ParticipantId,
    /// Participant clock reading when the button was pressed.
    pub local_timestamp: Millis,
    /// Offset the participant applied.
    pub offset_ms: Millis,
    /// `local_timestamp + offset_ms`.
    pub compensated_time: Millis,
}

impl BuzzSubmission {
    /// Build a submission, deriving its compensated time.
    pub fn new(participant_id: impl Into<ParticipantId>, local_timestamp: Millis, offset_ms: Millis) -> Self {
        Self {
            participant_id: participant_id.into(),
            local_timestamp,
            offset_ms,
            compensated_time: local_timestamp + offset_ms,
        }
    }
}

/// Authoritative state of a game, held by the host runtime.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GameSnapshot {
    /// Current phase.
    pub phase: GamePhase,
    /// Participants in join order.
    pub participants: IndexMap<ParticipantId, Participant>,
    /// Buzzes in arrival order.
    pub buzz_submissions: Vec<BuzzSubmission>,
    /// Winning participant once the round is decided.
    pub winner: Option<ParticipantId>,
    /// Host time at which the buzz window opened.
    pub buzz_window_started_at: Option<Millis>,
    /// Value currently shown by the countdown.
    pub countdown_value: Option<u32>,
}

impl GameSnapshot {
    /// Whether `participant_id` already has a recorded buzz.
    pub fn has_submitted(&self, participant_id: &str) -> bool {
        self.buzz_submissions
            .iter()
            .any(|submission| submission.participant_id == participant_id)
    }

    /// Whether every current participant has buzzed.
    pub fn all_submitted(&self) -> bool {
        !self.participants.is_empty()
            && self
                .participants
                .keys()
                .all(|participant_id| self.has_submitted(participant_id))
    }

    /// Display name of `participant_id`, if known.
    pub fn display_name(&self, participant_id: &str) -> Option<&str> {
        self.participants
            .get(participant_id)
            .map(|participant| participant.display_name.as_str())
    }
}

/// Earliest submission on the host clock.
///
/// Equal compensated times are resolved by ascending participant id so the
/// outcome never depends on arrival order.
pub fn determine_winner(submissions: &[BuzzSubmission]) -> Option<&BuzzSubmission> {
    submissions.iter().min_by(|a, b| {
        a.compensated_time
            .total_cmp(&b.compensated_time)
            .then_with(|| a.participant_id.cmp(&b.participant_id))
    })
}

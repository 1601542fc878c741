use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::game::GamePhase;

/// Game phase as shown to participants.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VisibleGamePhase {
    /// Waiting for the host to start.
    Lobby,
    /// Counting down.
    Countdown,
    /// Buzz window open.
    Ready,
    /// Buzzes are coming in.
    Buzzing,
    /// Winner decided.
    Result,
}

impl From<GamePhase> for VisibleGamePhase {
    fn from(value: GamePhase) -> Self {
        match value {
            GamePhase::Lobby => VisibleGamePhase::Lobby,
            GamePhase::Countdown => VisibleGamePhase::Countdown,
            GamePhase::Ready => VisibleGamePhase::Ready,
            GamePhase::Buzzing => VisibleGamePhase::Buzzing,
            GamePhase::Result => VisibleGamePhase::Result,
        }
    }
}

impl From<VisibleGamePhase> for GamePhase {
    fn from(value: VisibleGamePhase) -> Self {
        match value {
            VisibleGamePhase::Lobby => GamePhase::Lobby,
            VisibleGamePhase::Countdown => GamePhase::Countdown,
            VisibleGamePhase::Ready => GamePhase::Ready,
            VisibleGamePhase::Buzzing => GamePhase::Buzzing,
            VisibleGamePhase::Result => GamePhase::Result,
        }
    }
}

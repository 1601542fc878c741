//! Negotiation payloads carried opaquely by the signaling relay.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Session description or connectivity candidate exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    /// Session description proposed by the offerer.
    Offer {
        /// SDP blob.
        sdp: String,
    },
    /// Session description accepted by the answerer.
    Answer {
        /// SDP blob.
        sdp: String,
    },
    /// Trickled connectivity candidate.
    Candidate {
        /// Candidate line.
        candidate: String,
        /// Media stream identification tag.
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
        /// Index of the media description.
        #[serde(rename = "sdpMLineIndex", default)]
        sdp_m_line_index: Option<u16>,
    },
}

/// Reasons a relayed payload is not a usable negotiation message.
#[derive(Debug, Error)]
pub enum SignalPayloadError {
    /// Not one of the known shapes.
    #[error("malformed negotiation payload: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Well formed but empty.
    #[error("invalid negotiation payload: {0}")]
    Invalid(#[from] ValidationErrors),
}

impl Validate for SignalPayload {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        match self {
            SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp } => {
                if sdp.trim().is_empty() {
                    let mut err = ValidationError::new("sdp_blank");
                    err.message = Some("Session description must not be empty".into());
                    errors.add("sdp", err);
                }
            }
            SignalPayload::Candidate { candidate, .. } => {
                if candidate.trim().is_empty() {
                    let mut err = ValidationError::new("candidate_blank");
                    err.message = Some("Candidate must not be empty".into());
                    errors.add("candidate", err);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl SignalPayload {
    /// Parse and validate the `data` field of a `signal:receive` frame.
    pub fn from_value(value: serde_json::Value) -> Result<Self, SignalPayloadError> {
        let payload: SignalPayload = serde_json::from_value(value)?;
        payload.validate()?;
        Ok(payload)
    }

    /// Encode as the `data` field of a `signal:relay` frame.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Wire tag, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
        }
    }
}

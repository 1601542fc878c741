use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::{
    dto::{
        format_system_time,
        validation::{normalize_session_code, validate_session_code},
    },
    state::sessions::{SessionError, SessionNotice},
};

/// Frame received from a signaling client: an optional correlation id plus the message itself.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClientFrame {
    /// Echoed back in the response so clients can match replies to requests.
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// The request or relay payload.
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Reasons a text frame cannot be turned into a [`ClientFrame`].
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not JSON, or not one of the known messages.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ClientFrame {
    /// Parse a text frame and normalise the session codes it carries.
    pub fn from_json_str(text: &str) -> Result<Self, FrameError> {
        let mut frame: ClientFrame = serde_json::from_str(text)?;
        match &mut frame.message {
            ClientMessage::JoinSession { session_id }
            | ClientMessage::ReclaimHost { session_id, .. } => {
                *session_id = normalize_session_code(session_id);
            }
            _ => {}
        }
        Ok(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, ToSchema)]
/// Messages accepted from signaling WebSocket clients.
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Create a session hosted by the sending connection.
    #[serde(rename = "session:create")]
    CreateSession,
    /// Join an existing session as a participant.
    #[serde(rename = "session:join")]
    JoinSession {
        /// Code of the session to join.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Leave the current session on purpose (hosts end it).
    #[serde(rename = "session:leave")]
    LeaveSession,
    /// Take a session back after an unexpected host disconnect.
    #[serde(rename = "session:reclaim")]
    ReclaimHost {
        /// Code of the session to reclaim.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Secret handed out by `session:create`.
        #[serde(rename = "hostRecoveryToken")]
        host_recovery_token: String,
    },
    /// Forward an opaque negotiation payload to another connection.
    #[serde(rename = "signal:relay")]
    Relay {
        /// Connection id of the receiver.
        #[serde(rename = "targetId")]
        target_id: String,
        /// Payload passed through untouched.
        #[schema(value_type = Object)]
        data: serde_json::Value,
    },
}

impl ClientMessage {
    /// Wire name of the message, echoed in responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CreateSession => "session:create",
            ClientMessage::JoinSession { .. } => "session:join",
            ClientMessage::LeaveSession => "session:leave",
            ClientMessage::ReclaimHost { .. } => "session:reclaim",
            ClientMessage::Relay { .. } => "signal:relay",
        }
    }

    /// Session code carried by the message, validated.
    pub fn validated_session_id(&self) -> Option<Result<&str, SessionError>> {
        match self {
            ClientMessage::JoinSession { session_id }
            | ClientMessage::ReclaimHost { session_id, .. } => Some(
                validate_session_code(session_id)
                    .map(|()| session_id.as_str())
                    .map_err(|_| SessionError::NotFound(session_id.clone())),
            ),
            _ => None,
        }
    }
}

/// Machine-readable failure reasons carried in error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
pub enum ErrorCode {
    /// No session with that code.
    NotFound,
    /// The session host is in its grace period.
    HostUnavailable,
    /// The connection is the host of the session it tried to join.
    AlreadyHost,
    /// The connection already hosts a session.
    AlreadyHosting,
    /// The recovery token does not match.
    InvalidToken,
    /// The grace period is over.
    GraceExpired,
    /// Reclaim attempted while the host is connected.
    HostConnected,
    /// The connection is not part of any session.
    NotInSession,
    /// The frame could not be parsed.
    InvalidPayload,
    /// The server could not complete the request.
    Internal,
}

impl From<&SessionError> for ErrorCode {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::HostUnavailable(_) => ErrorCode::HostUnavailable,
            SessionError::AlreadyHost(_) => ErrorCode::AlreadyHost,
            SessionError::AlreadyHosting(_) => ErrorCode::AlreadyHosting,
            SessionError::InvalidToken => ErrorCode::InvalidToken,
            SessionError::GraceExpired(_) => ErrorCode::GraceExpired,
            SessionError::HostConnected(_) => ErrorCode::HostConnected,
            SessionError::NotInSession => ErrorCode::NotInSession,
            SessionError::CodeSpaceExhausted => ErrorCode::Internal,
        }
    }
}

/// Error half of a response envelope.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Failure reason.
    pub code: ErrorCode,
    /// Human readable description.
    pub message: String,
}

impl From<&SessionError> for ErrorBody {
    fn from(err: &SessionError) -> Self {
        Self {
            code: err.into(),
            message: err.to_string(),
        }
    }
}

/// Success payloads of the session requests.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, ToSchema)]
#[serde(untagged)]
pub enum ResponseData {
    /// Reply to `session:create`.
    Created {
        /// Shareable session code.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Secret needed to reclaim the session after a disconnect.
        #[serde(rename = "hostRecoveryToken")]
        host_recovery_token: String,
        /// Connection id of the host.
        #[serde(rename = "hostId")]
        host_id: String,
    },
    /// Reply to `session:join`.
    Joined {
        /// Joined session code.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Connection id of the joining participant.
        #[serde(rename = "participantId")]
        participant_id: String,
        /// Connection id of the host to negotiate with.
        #[serde(rename = "hostId")]
        host_id: String,
    },
    /// Reply to `session:reclaim`.
    Reclaimed {
        /// Reclaimed session code.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Participants still registered.
        participants: Vec<String>,
    },
    /// Reply to `session:leave`.
    Left {},
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, ToSchema)]
/// Messages pushed to signaling clients.
#[serde(tag = "type")]
pub enum ServerMessage {
    /// First frame on every connection.
    #[serde(rename = "connection:ready")]
    ConnectionReady {
        /// Identifier of this connection for the rest of its life.
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    /// Reply to a request, in the `{ok, data}` / `{ok, error}` envelope.
    #[serde(rename = "response")]
    Response {
        /// Correlation id copied from the request.
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Type of the request being answered.
        request: String,
        /// Whether the request succeeded.
        ok: bool,
        /// Payload on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
        /// Failure on error.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    /// A participant joined (or re-announced itself); sent to the host.
    #[serde(rename = "session:peer-joined")]
    PeerJoined {
        /// Connection id of the participant.
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// A participant left; sent to the host.
    #[serde(rename = "session:peer-left")]
    PeerLeft {
        /// Connection id of the participant.
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// The host dropped and may come back until `expiresAt`.
    #[serde(rename = "host:pending")]
    HostPending {
        /// Session code.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// RFC 3339 deadline of the grace period.
        #[serde(rename = "expiresAt")]
        expires_at: String,
    },
    /// The host reclaimed the session.
    #[serde(rename = "session:host-resumed")]
    HostResumed {
        /// Session code.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// The session is gone.
    #[serde(rename = "session:ended")]
    SessionEnded {
        /// Session code.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Negotiation payload relayed from another connection.
    #[serde(rename = "signal:receive")]
    SignalReceive {
        /// Connection id of the sender.
        #[serde(rename = "fromId")]
        from_id: String,
        /// Payload exactly as sent.
        #[schema(value_type = Object)]
        data: serde_json::Value,
    },
}

impl ServerMessage {
    /// Successful reply to `request`.
    pub fn success(request_id: Option<String>, request: &str, data: ResponseData) -> Self {
        ServerMessage::Response {
            request_id,
            request: request.to_string(),
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed reply to `request`.
    pub fn failure(request_id: Option<String>, request: &str, error: ErrorBody) -> Self {
        ServerMessage::Response {
            request_id,
            request: request.to_string(),
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

impl From<&SessionNotice> for ServerMessage {
    fn from(notice: &SessionNotice) -> Self {
        match notice {
            SessionNotice::PeerJoined { peer_id } => ServerMessage::PeerJoined {
                peer_id: peer_id.clone(),
            },
            SessionNotice::PeerLeft { peer_id } => ServerMessage::PeerLeft {
                peer_id: peer_id.clone(),
            },
            SessionNotice::HostPending {
                session_id,
                expires_at,
            } => ServerMessage::HostPending {
                session_id: session_id.clone(),
                expires_at: format_system_time(*expires_at),
            },
            SessionNotice::HostResumed { session_id } => ServerMessage::HostResumed {
                session_id: session_id.clone(),
            },
            SessionNotice::Ended { session_id } => ServerMessage::SessionEnded {
                session_id: session_id.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_join_with_request_id_and_normalises_code() {
        let frame = ClientFrame::from_json_str(
            r#"{"type":"session:join","requestId":"7","sessionId":" k7wq2m"}"#,
        )
        .unwrap();
        assert_eq!(frame.request_id.as_deref(), Some("7"));
        assert_eq!(
            frame.message,
            ClientMessage::JoinSession {
                session_id: "K7WQ2M".into()
            }
        );
    }

    #[test]
    fn relay_payload_is_left_untouched() {
        let frame = ClientFrame::from_json_str(
            r#"{"type":"signal:relay","targetId":"abc","data":{"type":"offer","sdp":"v=0","extra":[1,2]}}"#,
        )
        .unwrap();
        let ClientMessage::Relay { target_id, data } = frame.message else {
            panic!("expected relay");
        };
        assert_eq!(target_id, "abc");
        assert_eq!(data, json!({"type":"offer","sdp":"v=0","extra":[1,2]}));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(ClientFrame::from_json_str(r#"{"type":"session:explode"}"#).is_err());
        assert!(ClientFrame::from_json_str("not json").is_err());
    }

    #[test]
    fn invalid_code_maps_to_not_found() {
        let message = ClientMessage::JoinSession {
            session_id: "NOPE0".into(),
        };
        let err = message.validated_session_id().unwrap().unwrap_err();
        assert_eq!(ErrorCode::from(&err), ErrorCode::NotFound);
    }

    #[test]
    fn exhausted_code_space_is_a_server_failure() {
        let body = ErrorBody::from(&SessionError::CodeSpaceExhausted);
        assert_eq!(body.code, ErrorCode::Internal);
        assert_eq!(serde_json::to_value(body.code).unwrap(), json!("Internal"));
    }

    #[test]
    fn envelope_shapes() {
        let ok = ServerMessage::success(
            Some("1".into()),
            "session:create",
            ResponseData::Created {
                session_id: "K7WQ2M".into(),
                host_recovery_token: "secret".into(),
                host_id: "h".into(),
            },
        );
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({
                "type": "response",
                "requestId": "1",
                "request": "session:create",
                "ok": true,
                "data": {"sessionId": "K7WQ2M", "hostRecoveryToken": "secret", "hostId": "h"}
            })
        );

        let err = ServerMessage::failure(
            None,
            "session:join",
            ErrorBody::from(&SessionError::HostUnavailable("K7WQ2M".into())),
        );
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["error"]["code"], json!("HostUnavailable"));
        assert!(value.get("data").is_none());
    }

    #[test]
    fn responses_round_trip_for_clients() {
        let joined = ServerMessage::success(
            None,
            "session:join",
            ResponseData::Joined {
                session_id: "K7WQ2M".into(),
                participant_id: "p".into(),
                host_id: "h".into(),
            },
        );
        let text = serde_json::to_string(&joined).unwrap();
        assert_eq!(serde_json::from_str::<ServerMessage>(&text).unwrap(), joined);
    }
}

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::{
    dto::{format_system_time, validation::validate_session_code},
    state::sessions::SessionInfo,
};

/// Path parameters of `/sessions/{code}`.
#[derive(Debug, Deserialize, IntoParams, Validate)]
#[into_params(parameter_in = Path)]
pub struct SessionCodePath {
    /// Session code, case-insensitive.
    #[validate(custom(function = "validate_session_code"))]
    pub code: String,
}

/// Public view of a session, without its recovery token.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    /// Session code.
    pub session_id: String,
    /// Whether the host is attached.
    pub host_connected: bool,
    /// Participants currently joined.
    pub participant_count: usize,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 end of the host grace period, when one is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_grace_expires_at: Option<String>,
}

impl From<SessionInfo> for SessionStatusResponse {
    fn from(info: SessionInfo) -> Self {
        Self {
            session_id: info.code,
            host_connected: info.host_connected,
            participant_count: info.participants.len(),
            created_at: format_system_time(info.created_at),
            host_grace_expires_at: info.host_grace_expires_at.map(format_system_time),
        }
    }
}

//! Read-only projections of live sessions for the REST API.

use crate::{
    dto::{session::SessionStatusResponse, validation::normalize_session_code},
    error::ServiceError,
    state::SharedState,
};

/// Return the public status of session `code`.
pub fn get_session_status(
    state: &SharedState,
    code: &str,
) -> Result<SessionStatusResponse, ServiceError> {
    let code = normalize_session_code(code);
    state
        .sessions()
        .status(&code)
        .map(SessionStatusResponse::from)
        .ok_or_else(|| ServiceError::NotFound(format!("session `{code}`")))
}

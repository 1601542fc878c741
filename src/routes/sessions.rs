use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use axum_valid::Valid;

use crate::{
    dto::session::{SessionCodePath, SessionStatusResponse},
    error::AppError,
    services::session_service,
    state::SharedState,
};

/// Read-only session endpoints.
pub fn router() -> Router<SharedState> {
    Router::new().route("/sessions/{code}", get(get_session))
}

#[utoipa::path(
    get,
    path = "/sessions/{code}",
    tag = "sessions",
    params(SessionCodePath),
    responses(
        (status = 200, description = "Session status", body = SessionStatusResponse),
        (status = 400, description = "Malformed session code"),
        (status = 404, description = "No live session with this code")
    )
)]
/// Return whether a session exists, whether its host is attached and how many participants it has.
pub async fn get_session(
    State(state): State<SharedState>,
    Valid(Path(path)): Valid<Path<SessionCodePath>>,
) -> Result<Json<SessionStatusResponse>, AppError> {
    let payload = session_service::get_session_status(&state, &path.code)?;
    Ok(Json(payload))
}

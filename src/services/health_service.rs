use tracing::debug;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Report liveness along with the current session and connection counts.
pub fn health_status(state: &SharedState) -> HealthResponse {
    let sessions = state.sessions().session_count();
    let connections = state.connections().len();
    debug!(sessions, connections, "health check");
    HealthResponse::ok(sessions, connections)
}

use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for buzz-relay.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::sessions::get_session,
        crate::routes::websocket::ws_handler,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::session::SessionStatusResponse,
            crate::dto::ws::ClientMessage,
            crate::dto::ws::ServerMessage,
            crate::dto::ws::ResponseData,
            crate::dto::ws::ErrorBody,
            crate::dto::ws::ErrorCode,
            crate::dto::game::GameSnapshotDto,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sessions", description = "Read-only session status"),
        (name = "signaling", description = "WebSocket session lifecycle and negotiation relay"),
    )
)]
/// OpenAPI document for the REST routes and the signaling frames.
pub struct ApiDoc;

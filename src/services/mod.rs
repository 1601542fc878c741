/// Round-trip clock offset estimation.
pub mod clock_sync;
/// OpenAPI documentation generation.
pub mod documentation;
/// Host-side game runtime actor.
pub mod game_runtime;
/// Health check service.
pub mod health_service;
/// Host endpoint glue between direct channels and the game runtime.
pub mod host_endpoint;
/// Participant endpoint: clock sampling and buzz submission.
pub mod participant_endpoint;
/// Negotiation and channel state machine.
pub mod peer_connection;
/// Read-only session projections.
pub mod session_service;
/// WebSocket signaling connection and message handling service.
pub mod signaling_service;

//! Library crate for buzz-relay: session signaling, peer negotiation, clock sync and the buzz game runtime.

/// Runtime configuration.
pub mod config;
/// Wire types.
pub mod dto;
mod error;
/// HTTP and WebSocket routers.
pub mod routes;
/// Signaling, negotiation, clock sync and game logic.
pub mod services;
/// Shared state: sessions, connections, timers and the game model.
pub mod state;

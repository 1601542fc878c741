use std::time::SystemTime;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Direct-channel messages.
pub mod channel;
/// Game snapshot payloads.
pub mod game;
/// Health check payloads.
pub mod health;
/// Player-visible phase.
pub mod phase;
/// REST session views.
pub mod session;
/// Negotiation payloads carried by the relay.
pub mod signal;
/// Field validators.
pub mod validation;
/// Signaling WebSocket frames.
pub mod ws;

fn format_system_time(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "invalid-timestamp".into())
}

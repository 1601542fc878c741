use axum::extract::ws::Message;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    dto::ws::ServerMessage,
    state::sessions::{ConnectionId, SessionNotice, SessionNotifier},
};

#[derive(Clone)]
/// Handle used to push messages to a connected signaling client.
pub struct ClientConnection {
    /// Connection id announced in `connection:ready`.
    pub id: ConnectionId,
    /// Queue drained by the connection's writer task.
    pub tx: mpsc::UnboundedSender<Message>,
}

/// Registry of attached signaling sockets keyed by connection id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ClientConnection>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection, replacing any previous one with the same id.
    pub fn register(&self, connection: ClientConnection) {
        self.connections.insert(connection.id.clone(), connection);
    }

    /// Detach a connection.
    pub fn unregister(&self, id: &str) {
        self.connections.remove(id);
    }

    /// Whether `id` is attached.
    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of attached connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is attached.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Send `message` to `id`. Returns `false` when the connection is not attached or its writer is gone.
    pub fn send(&self, id: &str, message: &ServerMessage) -> bool {
        let Some(tx) = self.connections.get(id).map(|entry| entry.tx.clone()) else {
            debug!(connection = %id, "dropping message for detached connection");
            return false;
        };
        send_json(&tx, message)
    }
}

impl SessionNotifier for ConnectionRegistry {
    fn notify(&self, recipients: &[ConnectionId], notice: &SessionNotice) {
        let message = ServerMessage::from(notice);
        for recipient in recipients {
            self.send(recipient, &message);
        }
    }
}

/// Serialize `value` and queue it as a text frame. Returns `false` if the writer is closed.
///
/// Serialization failures are logged and reported as sent: retrying cannot help.
pub fn send_json<T>(tx: &mpsc::UnboundedSender<Message>, value: &T) -> bool
where
    T: ?Sized + Serialize + std::fmt::Debug,
{
    let payload = match serde_json::to_string(value) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialize message `{value:?}`");
            return true;
        }
    };
    tx.send(Message::Text(payload.into())).is_ok()
}

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::ws::{ClientFrame, ClientMessage, ErrorBody, ErrorCode, ResponseData, ServerMessage},
    state::{
        AppState, SharedState,
        connections::{ClientConnection, send_json},
        sessions::SessionError,
    },
};

/// Handle the full lifecycle of one signaling WebSocket connection.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing even while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let connection_id = Uuid::new_v4().to_string();
    state.connections().register(ClientConnection {
        id: connection_id.clone(),
        tx: outbound_tx.clone(),
    });
    info!(id = %connection_id, "signaling client connected");

    let ready = ServerMessage::ConnectionReady {
        connection_id: connection_id.clone(),
    };
    if !send_json(&outbound_tx, &ready) {
        handle_disconnect(&state, &connection_id);
        finalize(writer_task, outbound_tx).await;
        return;
    }

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                debug!(id = %connection_id, payload = %text, "received signaling message");
                let reply = match ClientFrame::from_json_str(&text) {
                    Ok(frame) => handle_frame(&state, &connection_id, frame),
                    Err(err) => {
                        warn!(id = %connection_id, error = %err, "failed to parse signaling message");
                        Some(reject_frame(&text, err.to_string()))
                    }
                };
                if let Some(reply) = reply {
                    if !send_json(&outbound_tx, &reply) {
                        info!(id = %connection_id, "connection closed while replying, terminating");
                        break;
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                info!(id = %connection_id, "signaling client closed");
                let _ = outbound_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) => {}
            Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(id = %connection_id, error = %err, "websocket error");
                break;
            }
        }
    }

    handle_disconnect(&state, &connection_id);
    info!(id = %connection_id, "signaling client disconnected");

    finalize(writer_task, outbound_tx).await;
}

/// Execute one client frame. Returns the reply to send back, if the message expects one.
pub fn handle_frame(state: &AppState, connection_id: &str, frame: ClientFrame) -> Option<ServerMessage> {
    let ClientFrame {
        request_id,
        message,
    } = frame;
    let request = message.kind();

    if let Some(Err(err)) = message.validated_session_id() {
        return Some(ServerMessage::failure(request_id, request, ErrorBody::from(&err)));
    }

    let result = match message {
        ClientMessage::CreateSession => state
            .sessions()
            .create_session(connection_id)
            .map(|created| ResponseData::Created {
                session_id: created.code,
                host_recovery_token: created.host_recovery_token,
                host_id: created.host_id,
            }),
        ClientMessage::JoinSession { session_id } => state
            .sessions()
            .join_session(&session_id, connection_id)
            .map(|joined| ResponseData::Joined {
                session_id: joined.code,
                participant_id: joined.participant_id,
                host_id: joined.host_id,
            }),
        ClientMessage::LeaveSession => state
            .sessions()
            .leave(connection_id)
            .map(|_| ResponseData::Left {}),
        ClientMessage::ReclaimHost {
            session_id,
            host_recovery_token,
        } => state
            .sessions()
            .reclaim_host(&session_id, &host_recovery_token, connection_id)
            .map(|reclaimed| ResponseData::Reclaimed {
                session_id: reclaimed.code,
                participants: reclaimed.participants,
            }),
        ClientMessage::Relay { target_id, data } => {
            relay(state, connection_id, &target_id, data);
            return None;
        }
    };

    Some(match result {
        Ok(data) => ServerMessage::success(request_id, request, data),
        Err(err) => {
            log_rejection(connection_id, request, &err);
            ServerMessage::failure(request_id, request, ErrorBody::from(&err))
        }
    })
}

/// Forward `data` from `from` to `target` when both belong to the same session.
///
/// Returns whether the payload was queued; undeliverable payloads are dropped silently.
pub fn relay(state: &AppState, from: &str, target: &str, data: serde_json::Value) -> bool {
    let sessions = state.sessions();
    let same_session = match (sessions.find_by_connection(from), sessions.find_by_connection(target)) {
        (Some(sender), Some(receiver)) => sender.code == receiver.code,
        _ => false,
    };
    if !same_session {
        debug!(from = %from, target = %target, "dropping relay outside a shared session");
        return false;
    }

    state.connections().send(
        target,
        &ServerMessage::SignalReceive {
            from_id: from.to_string(),
            data,
        },
    )
}

/// Map a dropped connection onto the session lifecycle.
pub fn handle_disconnect(state: &AppState, connection_id: &str) {
    state.connections().unregister(connection_id);
    state.sessions().disconnect(connection_id);
}

fn log_rejection(connection_id: &str, request: &str, err: &SessionError) {
    match err {
        SessionError::CodeSpaceExhausted => {
            warn!(id = %connection_id, request, error = %err, "session request failed")
        }
        _ => info!(id = %connection_id, request, error = %err, "session request rejected"),
    }
}

/// Error envelope for a frame that could not be parsed, echoing whatever identifies it.
fn reject_frame(text: &str, reason: String) -> ServerMessage {
    let raw = serde_json::from_str::<serde_json::Value>(text).ok();
    let field = |name: &str| {
        raw.as_ref()
            .and_then(|value| value.get(name))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    };

    ServerMessage::Response {
        request_id: field("requestId"),
        request: field("type").unwrap_or_else(|| "unknown".into()),
        ok: false,
        data: None,
        error: Some(ErrorBody {
            code: ErrorCode::InvalidPayload,
            message: reason,
        }),
    }
}

async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::AppConfig;

    struct Client {
        id: String,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl Client {
        fn attach(state: &AppState, id: &str) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            state.connections().register(ClientConnection { id: id.into(), tx });
            Self { id: id.into(), rx }
        }

        fn request(&self, state: &AppState, text: &str) -> serde_json::Value {
            let frame = ClientFrame::from_json_str(text).unwrap();
            let reply = handle_frame(state, &self.id, frame).expect("reply");
            serde_json::to_value(reply).unwrap()
        }

        fn received(&mut self) -> Vec<serde_json::Value> {
            let mut out = Vec::new();
            while let Ok(Message::Text(text)) = self.rx.try_recv() {
                out.push(serde_json::from_str(text.as_str()).unwrap());
            }
            out
        }
    }

    #[tokio::test]
    async fn create_join_and_relay() {
        let state = AppState::new(AppConfig::default());
        let mut host = Client::attach(&state, "h");
        let mut guest = Client::attach(&state, "p");
        let mut stranger = Client::attach(&state, "x");

        let created = host.request(&state, r#"{"type":"session:create","requestId":"1"}"#);
        assert_eq!(created["ok"], json!(true));
        assert_eq!(created["requestId"], json!("1"));
        let code = created["data"]["sessionId"].as_str().unwrap().to_string();

        let joined = guest.request(
            &state,
            &format!(r#"{{"type":"session:join","sessionId":"{}"}}"#, code.to_lowercase()),
        );
        assert_eq!(joined["data"]["hostId"], json!("h"));
        assert_eq!(
            host.received(),
            vec![json!({"type": "session:peer-joined", "peerId": "p"})]
        );

        let offer = json!({"type": "offer", "sdp": "v=0"});
        let relay = ClientFrame::from_json_str(
            &json!({"type": "signal:relay", "targetId": "h", "data": offer}).to_string(),
        )
        .unwrap();
        assert!(handle_frame(&state, "p", relay.clone()).is_none());
        assert_eq!(
            host.received(),
            vec![json!({"type": "signal:receive", "fromId": "p", "data": offer})]
        );

        // Outsiders cannot reach session members.
        assert!(handle_frame(&state, "x", relay).is_none());
        assert!(host.received().is_empty());
        assert!(!relay_to(&state, "p", "x"));
        assert!(stranger.received().is_empty());
        assert!(guest.received().is_empty());
    }

    fn relay_to(state: &AppState, from: &str, target: &str) -> bool {
        relay(state, from, target, json!({"type": "candidate", "candidate": "c"}))
    }

    #[tokio::test]
    async fn errors_use_the_envelope() {
        let state = AppState::new(AppConfig::default());
        let guest = Client::attach(&state, "p");

        let missing = guest.request(&state, r#"{"type":"session:join","sessionId":"ZZZZZZ","requestId":"9"}"#);
        assert_eq!(missing["ok"], json!(false));
        assert_eq!(missing["request"], json!("session:join"));
        assert_eq!(missing["error"]["code"], json!("NotFound"));

        let malformed = guest.request(&state, r#"{"type":"session:join","sessionId":"no!"}"#);
        assert_eq!(malformed["error"]["code"], json!("NotFound"));

        let leave = guest.request(&state, r#"{"type":"session:leave"}"#);
        assert_eq!(leave["error"]["code"], json!("NotInSession"));

        let rejected = serde_json::to_value(reject_frame(
            r#"{"type":"session:dance","requestId":"4"}"#,
            "unknown variant".into(),
        ))
        .unwrap();
        assert_eq!(rejected["requestId"], json!("4"));
        assert_eq!(rejected["request"], json!("session:dance"));
        assert_eq!(rejected["error"]["code"], json!("InvalidPayload"));
    }

    #[tokio::test(start_paused = true)]
    async fn host_disconnect_starts_grace_and_reclaim_resumes() {
        let state = AppState::new(AppConfig::default());
        let host = Client::attach(&state, "h");
        let mut guest = Client::attach(&state, "p");

        let created = host.request(&state, r#"{"type":"session:create"}"#);
        let code = created["data"]["sessionId"].as_str().unwrap().to_string();
        let token = created["data"]["hostRecoveryToken"].as_str().unwrap().to_string();
        guest.request(&state, &format!(r#"{{"type":"session:join","sessionId":"{code}"}}"#));

        handle_disconnect(&state, "h");
        let pending = guest.received();
        assert_eq!(pending[0]["type"], json!("host:pending"));
        assert_eq!(pending[0]["sessionId"], json!(code));

        let mut back = Client::attach(&state, "h2");
        let reclaimed = back.request(
            &state,
            &format!(
                r#"{{"type":"session:reclaim","sessionId":"{code}","hostRecoveryToken":"{token}"}}"#
            ),
        );
        assert_eq!(reclaimed["data"]["participants"], json!(["p"]));
        assert_eq!(
            guest.received(),
            vec![json!({"type": "session:host-resumed", "sessionId": code})]
        );
        assert_eq!(
            back.received(),
            vec![json!({"type": "session:peer-joined", "peerId": "p"})]
        );
    }
}

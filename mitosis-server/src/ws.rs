//! WebSocket event channel.
//!
//! Clients join task rooms with `{"action":"join","task_id":"..."}` and
//! receive events for joined rooms only.

use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use mitosis::broadcast::{EventBroadcaster, room_name};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Join { task_id: String },
    Leave { task_id: String },
    Ping,
}

/// GET /ws, /socket.io/, /api/socket.io/
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_session(socket, state))
}

async fn ws_session(mut socket: WebSocket, state: AppState) {
    let events = state.events().clone();
    let mut subscription = events.connect();
    let connection = subscription.id;

    let hello = json!({ "event": "connected", "connection_id": connection }).to_string();
    if socket.send(WsMessage::Text(hello.into())).await.is_err() {
        events.disconnect(connection);
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                let reply = handle_client_message(&events, connection, text.as_str());
                if socket.send(WsMessage::Text(reply.to_string().into())).await.is_err() {
                    break;
                }
            }
            outgoing = subscription.events.recv() => {
                let Some(event) = outgoing else { break };
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if socket.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    events.disconnect(connection);
    debug!(connection, "websocket closed");
}

/// Apply one client frame and build the acknowledgement.
fn handle_client_message(events: &EventBroadcaster, connection: u64, text: &str) -> Value {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => return json!({ "event": "error", "error": format!("invalid message: {err}") }),
    };
    match message {
        ClientMessage::Join { task_id } => match events.subscribe(connection, &task_id) {
            Ok(()) => json!({ "event": "joined", "task_id": task_id, "room": room_name(&task_id) }),
            Err(err) => json!({ "event": "error", "error": err.to_string() }),
        },
        ClientMessage::Leave { task_id } => match events.unsubscribe(connection, &task_id) {
            Ok(was_member) => json!({
                "event": "left",
                "task_id": task_id,
                "room": room_name(&task_id),
                "was_member": was_member,
            }),
            Err(err) => json!({ "event": "error", "error": err.to_string() }),
        },
        ClientMessage::Ping => json!({ "event": "pong" }),
    }
}

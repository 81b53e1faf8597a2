//! Connection Fabric websocket handler (spec §4.5). Grounded on the
//! teacher's `realtime/websocket.rs`: the task fan-out with
//! `tokio::select!` aborting siblings, and the heartbeat task, survive;
//! DAG-CBOR framing and AT Protocol subscription tickets do not — this
//! wire format is plain JSON and auth is the Session Service's access JWT.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientEvent {
    #[serde(rename = "message:send")]
    MessageSend { conv_id: Uuid, content: String, kind: Option<String>, metadata: Option<serde_json::Value>, reply_to_id: Option<Uuid> },
    #[serde(rename = "message:edit")]
    MessageEdit { message_id: Uuid, content: String },
    #[serde(rename = "message:delete")]
    MessageDelete { message_id: Uuid },
    #[serde(rename = "message:mark-read")]
    MessageMarkRead { message_id: Uuid },
    #[serde(rename = "reaction:add")]
    ReactionAdd { message_id: Uuid, emoji: String },
    #[serde(rename = "reaction:remove")]
    ReactionRemove { message_id: Uuid, emoji: String },
    #[serde(rename = "typing:start")]
    TypingStart { conv_id: Uuid },
    #[serde(rename = "typing:stop")]
    TypingStop { conv_id: Uuid },
    #[serde(rename = "presence:update")]
    PresenceUpdate { status: String },
    #[serde(rename = "presence:heartbeat")]
    PresenceHeartbeat,
}

#[derive(Serialize)]
struct ServerEvent<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: serde_json::Value,
}

pub async fn connect(ws: WebSocketUpgrade, State(state): State<AppState>, Query(query): Query<ConnectQuery>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

async fn handle_socket(socket: WebSocket, state: AppState, token: String) {
    let (user_id, session_id) = match state.session_service.validate_access_token(&token).await {
        Ok(ids) => ids,
        Err(err) => {
            let (mut sender, _) = socket.split();
            let _ = send_json(&mut sender, &ServerEvent { kind: "connection:error", payload: serde_json::to_value(err.to_socket_payload()).unwrap_or_default() }).await;
            return;
        }
    };

    if !state.fabric.try_acquire_slot(user_id) {
        let (mut sender, _) = socket.split();
        let _ = send_json(&mut sender, &ServerEvent { kind: "connection:error", payload: serde_json::json!({ "error": "rate_limited", "message": "too many connections" }) }).await;
        return;
    }

    let socket_id = Uuid::new_v4().to_string();
    if let Err(err) = state.fabric.mark_online(user_id, &socket_id).await {
        tracing::warn!(%user_id, error = %err, "failed to mark socket online");
    }
    let _ = state.session_service.update_socket_id(session_id, Some(&socket_id)).await;

    let (user_rx, conv_rxs, conv_ids) = match state.fabric.subscribe_active_rooms(user_id).await {
        Ok(rooms) => rooms,
        Err(err) => {
            tracing::error!(%user_id, error = %err, "failed to resolve conversation rooms");
            state.fabric.release_slot(user_id);
            return;
        }
    };

    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    {
        let mut guard = sender.lock().await;
        let _ = send_json(&mut *guard, &ServerEvent { kind: "connection.success", payload: serde_json::json!({ "userId": user_id, "conversations": conv_ids }) }).await;
    }

    let forward_sender = sender.clone();
    let mut forward_task = tokio::spawn(async move {
        let mut stream = tokio_stream::StreamMap::new();
        stream.insert("user".to_string(), tokio_stream::wrappers::BroadcastStream::new(user_rx));
        for (id, rx) in conv_ids.iter().zip(conv_rxs.into_iter()) {
            stream.insert(id.to_string(), tokio_stream::wrappers::BroadcastStream::new(rx));
        }
        while let Some((_room, event)) = stream.next().await {
            let Ok(envelope) = event else { continue };
            let mut guard = forward_sender.lock().await;
            if guard.send(WsMessage::Text(envelope.to_string().into())).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                WsMessage::Close(_) => break,
                WsMessage::Text(text) => {
                    handle_client_event(&recv_state, user_id, &text).await;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                WsMessage::Binary(_) => {}
            }
        }
    });

    let heartbeat_sender = sender.clone();
    let mut heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            let mut guard = heartbeat_sender.lock().await;
            if guard.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut forward_task => { recv_task.abort(); heartbeat_task.abort(); }
        _ = &mut recv_task => { forward_task.abort(); heartbeat_task.abort(); }
        _ = &mut heartbeat_task => { forward_task.abort(); recv_task.abort(); }
    }

    state.fabric.release_slot(user_id);
    let _ = state.session_service.update_socket_id(session_id, None).await;
    if let Err(err) = state.fabric.mark_offline_and_maybe_announce(user_id, &socket_id).await {
        tracing::warn!(%user_id, error = %err, "failed to mark socket offline");
    }
}

async fn handle_client_event(state: &AppState, user_id: Uuid, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(err) => {
            tracing::debug!(error = %err, "failed to parse client event");
            return;
        }
    };

    let result = match event {
        ClientEvent::MessageSend { conv_id, content, kind, metadata, reply_to_id } => {
            state
                .message_service
                .send_message(conv_id, user_id, content, kind.as_deref().unwrap_or("text"), metadata.unwrap_or_default(), reply_to_id)
                .await
                .map(|_| ())
        }
        ClientEvent::MessageEdit { message_id, content } => state.message_service.edit_message(message_id, user_id, content).await.map(|_| ()),
        ClientEvent::MessageDelete { message_id } => state.message_service.delete_message(message_id, user_id).await,
        ClientEvent::MessageMarkRead { message_id } => state.message_service.mark_read(message_id, user_id).await,
        ClientEvent::ReactionAdd { message_id, emoji } => state.message_service.add_reaction(message_id, user_id, emoji).await,
        ClientEvent::ReactionRemove { message_id, emoji } => state.message_service.remove_reaction(message_id, user_id, &emoji).await,
        ClientEvent::TypingStart { conv_id } => {
            state.fabric.note_typing(user_id, conv_id);
            state.fabric.broadcast_to_conversation(conv_id, "typing.start", serde_json::json!({ "userId": user_id, "convId": conv_id })).await;
            Ok(())
        }
        ClientEvent::TypingStop { conv_id } => {
            state.fabric.clear_typing(user_id, conv_id);
            state.fabric.broadcast_to_conversation(conv_id, "typing.stop", serde_json::json!({ "userId": user_id, "convId": conv_id })).await;
            Ok(())
        }
        ClientEvent::PresenceUpdate { status } => {
            let status = if status == "away" { "away" } else { "online" };
            match state.store.set_presence(user_id, status).await {
                Ok(()) => {
                    state.fabric.broadcast_to_user(user_id, "user.status", serde_json::json!({ "userId": user_id, "status": status })).await;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }
        ClientEvent::PresenceHeartbeat => state.store.set_presence(user_id, "online").await,
    };

    if let Err(err) = result {
        tracing::debug!(%user_id, error = %err, "client event rejected");
    }
}

async fn send_json<T: Serialize>(
    sender: &mut futures::stream::SplitSink<WebSocket, WsMessage>,
    value: &T,
) -> Result<(), ()> {
    let text = serde_json::to_string(value).map_err(|_| ())?;
    sender.send(WsMessage::Text(text.into())).await.map_err(|_| ())
}

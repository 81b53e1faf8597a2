//! Message authoring, history, edits, reactions, and read receipts over
//! HTTP — the REST complement to the `message:*`/`reaction:*` socket
//! ingress events in §4.5. Grounded on the teacher's
//! `handlers/send_message.rs` and `handlers/get_messages.rs`.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::CoreResult;
use crate::models::Message;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub reply_to: Option<Uuid>,
}

fn default_kind() -> String {
    "text".to_string()
}

pub async fn send(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(convo_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> CoreResult<Json<Message>> {
    let message = state
        .message_service
        .send_message(convo_id, auth_user.user_id, req.body, &req.kind, req.metadata, req.reply_to)
        .await?;
    Ok(Json(message))
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    pub cursor: Option<DateTime<Utc>>,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct ListMessagesResponse {
    pub messages: Vec<Message>,
    pub next_cursor: Option<DateTime<Utc>>,
}

pub async fn list(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(convo_id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> CoreResult<Json<ListMessagesResponse>> {
    let (messages, next_cursor) = state.store.list_messages(convo_id, auth_user.user_id, query.limit, query.cursor).await?;
    Ok(Json(ListMessagesResponse { messages, next_cursor }))
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub body: String,
}

pub async fn edit(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(msg_id): Path<Uuid>,
    Json(req): Json<EditMessageRequest>,
) -> CoreResult<Json<Message>> {
    let message = state.message_service.edit_message(msg_id, auth_user.user_id, req.body).await?;
    Ok(Json(message))
}

pub async fn delete(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(msg_id): Path<Uuid>,
) -> CoreResult<axum::http::StatusCode> {
    state.message_service.delete_message(msg_id, auth_user.user_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

pub async fn add_reaction(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(msg_id): Path<Uuid>,
    Json(req): Json<ReactionRequest>,
) -> CoreResult<axum::http::StatusCode> {
    state.message_service.add_reaction(msg_id, auth_user.user_id, req.emoji).await?;
    Ok(axum::http::StatusCode::CREATED)
}

pub async fn remove_reaction(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path((msg_id, emoji)): Path<(Uuid, String)>,
) -> CoreResult<axum::http::StatusCode> {
    state.message_service.remove_reaction(msg_id, auth_user.user_id, &emoji).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn mark_read(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(msg_id): Path<Uuid>,
) -> CoreResult<axum::http::StatusCode> {
    state.message_service.mark_read(msg_id, auth_user.user_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

//! Conversation lifecycle: direct/group creation, listing, leaving.
//! Grounded on the teacher's `handlers/create_convo.rs` / `get_convos.rs`
//! shape, generalized from MLS group creation to the plain
//! direct/group split in §3.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{CoreError, CoreResult};
use crate::models::{Conversation, ConversationSummary};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateDirectRequest {
    pub user_id: Uuid,
}

pub async fn create_direct(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<CreateDirectRequest>,
) -> CoreResult<Json<Conversation>> {
    if req.user_id == auth_user.user_id {
        return Err(CoreError::InvalidInput("cannot start a direct conversation with yourself".into()));
    }
    let convo = state.store.create_direct_conversation(auth_user.user_id, req.user_id).await?;
    Ok(Json(convo))
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub member_ids: Vec<Uuid>,
}

pub async fn create_group(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<CreateGroupRequest>,
) -> CoreResult<Json<Conversation>> {
    let convo = state.store.create_group_conversation(auth_user.user_id, req.name, &req.member_ids).await?;
    Ok(Json(convo))
}

#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationSummary>,
}

pub async fn list(State(state): State<AppState>, auth_user: AuthUser) -> CoreResult<Json<ConversationListResponse>> {
    let conversations = state.store.get_user_conversations(auth_user.user_id).await?;
    Ok(Json(ConversationListResponse { conversations }))
}

pub async fn get(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(convo_id): Path<Uuid>,
) -> CoreResult<Json<Conversation>> {
    if !state.store.is_member(convo_id, auth_user.user_id).await? {
        return Err(CoreError::NotParticipant);
    }
    let convo = state.store.get_conversation(convo_id).await?.ok_or(CoreError::NotFound)?;
    Ok(Json(convo))
}

pub async fn leave(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(convo_id): Path<Uuid>,
) -> CoreResult<axum::http::StatusCode> {
    if !state.store.is_member(convo_id, auth_user.user_id).await? {
        return Err(CoreError::NotParticipant);
    }
    state.store.mark_left(convo_id, auth_user.user_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

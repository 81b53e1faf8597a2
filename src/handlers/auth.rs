//! Session issuance (spec §4.6). Registration itself is out of scope
//! (§3): login resolves a username to a user row, creating one if absent,
//! exactly as the Store's `get_or_create_user` contract promises.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{CoreError, CoreResult};
use crate::models::{validate_username, User};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub device_fingerprint: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
}

#[tracing::instrument(skip(state, req), fields(username = %req.username))]
pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> CoreResult<Json<LoginResponse>> {
    if !validate_username(&req.username) {
        return Err(CoreError::InvalidInput("username must match ^[A-Za-z0-9_]{3,50}$".into()));
    }

    let user = state.store.get_or_create_user(&req.username).await?;
    let issued = state.session_service.create(user.id, &req.device_fingerprint).await?;

    Ok(Json(LoginResponse {
        user,
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
}

pub async fn refresh(State(state): State<AppState>, Json(req): Json<RefreshRequest>) -> CoreResult<Json<RefreshResponse>> {
    let access_token = state.session_service.refresh_access_token(&req.refresh_token).await?;
    Ok(Json(RefreshResponse { access_token }))
}

pub async fn logout(State(state): State<AppState>, auth_user: AuthUser) -> CoreResult<axum::http::StatusCode> {
    state.session_service.invalidate(auth_user.session_id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct LogoutAllResponse {
    pub user_id: Uuid,
}

pub async fn logout_all(State(state): State<AppState>, auth_user: AuthUser) -> CoreResult<Json<LogoutAllResponse>> {
    state.session_service.invalidate_all(auth_user.user_id).await?;
    Ok(Json(LogoutAllResponse { user_id: auth_user.user_id }))
}

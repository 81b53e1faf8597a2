//! HS256 JWT issuance and verification for the Session Service (spec
//! §4.6). Grounded on the teacher's `auth.rs`: the `AuthError`/
//! `IntoResponse` shape and `FromRequestParts` extractor idiom survive;
//! the ES256/ES256K DID-document-resolution machinery (the bulk of the
//! teacher's file) does not, since this system authenticates per-device
//! sessions rather than inter-service DID requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub sid: Uuid,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: Uuid,
    pub sid: Uuid,
    pub exp: i64,
}

pub fn sign_access_token(secret: &str, user_id: Uuid, session_id: Uuid, ttl: std::time::Duration) -> Result<String, CoreError> {
    let claims = AccessClaims {
        sub: user_id,
        sid: session_id,
        exp: (chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default()).timestamp(),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| CoreError::Internal(e.into()))
}

pub fn sign_refresh_token(secret: &str, user_id: Uuid, session_id: Uuid, ttl: std::time::Duration) -> Result<String, CoreError> {
    let claims = RefreshClaims {
        sub: user_id,
        sid: session_id,
        exp: (chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default()).timestamp(),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| CoreError::Internal(e.into()))
}

pub fn verify_access_token(secret: &str, token: &str) -> Result<AccessClaims, CoreError> {
    decode::<AccessClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
        .map(|d| d.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => CoreError::AuthExpired,
            _ => CoreError::AuthInvalid,
        })
}

pub fn verify_refresh_token(secret: &str, token: &str) -> Result<RefreshClaims, CoreError> {
    decode::<RefreshClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
        .map(|d| d.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => CoreError::AuthExpired,
            _ => CoreError::AuthInvalid,
        })
}

/// Authenticated identity extracted from the `Authorization: Bearer`
/// header. The handshake validation this performs — decode and verify the
/// access JWT, then confirm the referenced session is active and
/// unexpired in the Store — is exactly §6.2's contract, reused for both
/// the HTTP surface and the websocket handshake.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub session_id: Uuid,
}

impl FromRequestParts<crate::AppState> for AuthUser {
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, state: &crate::AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(CoreError::AuthRequired)?;
        let token = header.strip_prefix("Bearer ").ok_or(CoreError::AuthInvalid)?;

        let claims = verify_access_token(&state.config.jwt_secret, token)?;
        let session = state
            .store
            .get_session(claims.sid)
            .await?
            .ok_or(CoreError::AuthInvalid)?;

        if !session.is_logged_in() {
            return Err(CoreError::AuthExpired);
        }

        Ok(AuthUser { user_id: claims.sub, session_id: claims.sid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_round_trips() {
        let secret = "test-secret";
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let token = sign_access_token(secret, user_id, session_id, std::time::Duration::from_secs(900)).unwrap();
        let claims = verify_access_token(secret, &token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.sid, session_id);
    }

    #[test]
    fn expired_access_token_is_rejected() {
        let secret = "test-secret";
        let token = sign_access_token(secret, Uuid::new_v4(), Uuid::new_v4(), std::time::Duration::from_secs(0)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let err = verify_access_token(secret, &token).unwrap_err();
        assert!(matches!(err, CoreError::AuthExpired));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let token = sign_access_token("secret-a", Uuid::new_v4(), Uuid::new_v4(), std::time::Duration::from_secs(900)).unwrap();
        let err = verify_access_token("secret-b", &token).unwrap_err();
        assert!(matches!(err, CoreError::AuthInvalid));
    }
}

//! Session Service (spec §4.6): per-device sessions and the
//! socket-id↔session-id binding, plus the HS256 access/refresh JWT pair
//! issued alongside each session.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::auth::{sign_access_token, sign_refresh_token, verify_refresh_token};
use crate::config::Config;
use crate::db::Store;
use crate::error::{CoreError, CoreResult};
use crate::models::Session;

pub struct IssuedCredentials {
    pub session: Session,
    pub access_token: String,
    pub refresh_token: String,
}

pub struct SessionService {
    store: Arc<Store>,
    config: Arc<Config>,
}

impl SessionService {
    pub fn new(store: Arc<Store>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    pub async fn create(&self, user_id: Uuid, device_fingerprint: &str) -> CoreResult<IssuedCredentials> {
        let session = self
            .store
            .create_session(user_id, device_fingerprint, self.config.refresh_token_ttl)
            .await?;

        let access_token = sign_access_token(&self.config.jwt_secret, user_id, session.id, self.config.access_token_ttl)?;
        let refresh_token = sign_refresh_token(&self.config.jwt_refresh_secret, user_id, session.id, self.config.refresh_token_ttl)?;

        Ok(IssuedCredentials { session, access_token, refresh_token })
    }

    pub async fn touch(&self, session_id: Uuid) -> CoreResult<()> {
        self.store.touch_session(session_id).await
    }

    pub async fn invalidate(&self, session_id: Uuid) -> CoreResult<()> {
        self.store.invalidate_session(session_id).await
    }

    pub async fn invalidate_all(&self, user_id: Uuid) -> CoreResult<()> {
        self.store.invalidate_all_sessions(user_id).await
    }

    pub async fn active_sessions_for(&self, user_id: Uuid) -> CoreResult<Vec<Session>> {
        self.store.active_sessions_for(user_id).await
    }

    pub async fn update_socket_id(&self, session_id: Uuid, socket_id: Option<&str>) -> CoreResult<()> {
        self.store.update_socket_id(session_id, socket_id).await
    }

    /// Exchanges a valid, non-expired, non-invalidated refresh credential
    /// for a new access credential. The refresh credential's own expiry is
    /// not extended.
    pub async fn refresh_access_token(&self, refresh_token: &str) -> CoreResult<String> {
        let claims = verify_refresh_token(&self.config.jwt_refresh_secret, refresh_token)?;
        let session = self.store.get_session(claims.sid).await?.ok_or(CoreError::AuthInvalid)?;
        if !session.is_logged_in() {
            return Err(CoreError::AuthExpired);
        }
        sign_access_token(&self.config.jwt_secret, claims.sub, claims.sid, self.config.access_token_ttl)
    }

    /// §6.2's handshake validation: decode+verify the access JWT, then
    /// confirm the referenced session is active and unexpired in the Store.
    pub async fn validate_access_token(&self, access_token: &str) -> CoreResult<(Uuid, Uuid)> {
        let claims = crate::auth::verify_access_token(&self.config.jwt_secret, access_token)?;
        let session = self.store.get_session(claims.sid).await?.ok_or(CoreError::AuthInvalid)?;
        if !session.is_logged_in() {
            return Err(CoreError::AuthExpired);
        }
        Ok((claims.sub, claims.sid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_credentials_carry_the_same_session_id_as_both_tokens() {
        let secret = "access-secret";
        let refresh_secret = "refresh-secret";
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let access = sign_access_token(secret, user_id, session_id, Duration::from_secs(900)).unwrap();
        let refresh = sign_refresh_token(refresh_secret, user_id, session_id, Duration::from_secs(604_800)).unwrap();

        let access_claims = crate::auth::verify_access_token(secret, &access).unwrap();
        let refresh_claims = verify_refresh_token(refresh_secret, &refresh).unwrap();
        assert_eq!(access_claims.sid, refresh_claims.sid);
        assert_eq!(access_claims.sub, refresh_claims.sub);
    }
}

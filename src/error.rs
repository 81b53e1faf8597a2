use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

/// The one error taxonomy shared by the HTTP surface and the socket surface.
///
/// Handlers convert this to a response via [`IntoResponse`]; socket
/// handlers convert it to a `<domain>:error` payload via [`CoreError::code`]
/// and [`CoreError::to_socket_payload`], so the two surfaces never drift.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("authentication required")]
    AuthRequired,
    #[error("invalid credential")]
    AuthInvalid,
    #[error("credential expired")]
    AuthExpired,
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("not a participant in this conversation")]
    NotParticipant,
    #[error("not the author of this resource")]
    NotAuthor,
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    ConflictUniqueViolation(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("conversation is closed")]
    ConversationClosed,
    #[error("invalid reply target")]
    InvalidReply,
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Stable machine-readable code, shared by both HTTP and socket payloads.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::AuthRequired => "auth_required",
            CoreError::AuthInvalid => "auth_invalid",
            CoreError::AuthExpired => "auth_expired",
            CoreError::RateLimited { .. } => "rate_limited",
            CoreError::NotParticipant => "not_participant",
            CoreError::NotAuthor => "not_author",
            CoreError::NotFound => "not_found",
            CoreError::ConflictUniqueViolation(_) => "conflict_unique_violation",
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::PayloadTooLarge => "payload_too_large",
            CoreError::ConversationClosed => "conversation_closed",
            CoreError::InvalidReply => "invalid_reply",
            CoreError::StorageUnavailable(_) => "storage_unavailable",
            CoreError::QueueUnavailable(_) => "queue_unavailable",
            CoreError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            CoreError::AuthRequired | CoreError::AuthInvalid | CoreError::AuthExpired => {
                StatusCode::UNAUTHORIZED
            }
            CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::NotParticipant | CoreError::NotAuthor => StatusCode::FORBIDDEN,
            CoreError::NotFound => StatusCode::NOT_FOUND,
            CoreError::ConflictUniqueViolation(_) | CoreError::ConversationClosed => {
                StatusCode::CONFLICT
            }
            CoreError::InvalidInput(_) | CoreError::InvalidReply => StatusCode::BAD_REQUEST,
            CoreError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            CoreError::StorageUnavailable(_) | CoreError::QueueUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Payload for a `<domain>:error` socket event.
    pub fn to_socket_payload(&self) -> SocketErrorPayload {
        SocketErrorPayload {
            error: self.code(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SocketErrorPayload {
    pub error: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let retry_after = match &self {
            CoreError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        if matches!(self, CoreError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }

        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
            details: None,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert("Retry-After", secs.into());
        }
        response
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

use crate::gateway::GatewayError;

/// Errors surfaced by the chat engine to its callers.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error("validation failed: {0}")] Validation(String),
    #[error("invalid state: {0}")] InvalidState(String),
    #[error("{0} not found")] NotFound(&'static str),
    #[error("transport error: {0}")] Transport(String),
    #[error("authorization expired")] AuthExpired,
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    /// Callers defer (re-authenticate) on this instead of alarming the user.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, ChatError::AuthExpired)
    }
}

impl From<GatewayError> for ChatError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::NotFound => ChatError::NotFound("resource"),
            GatewayError::Rejected(reason) => ChatError::Validation(reason),
            GatewayError::Transport(reason) => ChatError::Transport(reason),
            GatewayError::AuthExpired => ChatError::AuthExpired,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")] BadRequest(String),
    #[error("unauthorized")] Unauthorized,
    #[error("forbidden")] Forbidden,
    #[error("not found")] NotFound,
    #[error("{0}")] Conflict(String),
    #[error("upstream unavailable")] BadGateway,
    #[error("internal error")] Internal,
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::Validation(m) => ApiError::BadRequest(m),
            ChatError::InvalidState(m) => ApiError::Conflict(m),
            ChatError::NotFound(_) => ApiError::NotFound,
            ChatError::Transport(_) => ApiError::BadGateway,
            ChatError::AuthExpired => ApiError::Unauthorized,
        }
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway => StatusCode::BAD_GATEWAY,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        HttpResponse::build(status).json(ApiErrorBody { error: self.to_string() })
    }
}

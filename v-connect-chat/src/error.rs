use thiserror::Error;
use v::http::{GitHubFieldError, HttpError};

use crate::coord::CoordError;
use crate::domain::event::ErrorPayload;
use crate::storage::StoreError;

/// 服务错误分类 / Service error taxonomy
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// 字段缺失或格式错误 / missing or malformed fields
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    InvalidOperation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Authentication(String),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Rate limit exceeded")]
    RateLimited,
    /// 持久化或协调存储不可达 / durable or coordination store unreachable
    #[error("{0}")]
    Infrastructure(String),
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "VALIDATION_ERROR",
            ChatError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ChatError::InvalidOperation(_) => "INVALID_OPERATION",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::Authentication(_) => "AUTHENTICATION_ERROR",
            ChatError::NotAuthenticated => "NOT_AUTHENTICATED",
            ChatError::Forbidden(_) => "FORBIDDEN",
            ChatError::Conflict(_) => "CONFLICT",
            ChatError::RateLimited => "RATE_LIMITED",
            ChatError::Infrastructure(_) => "INFRASTRUCTURE_ERROR",
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            message: self.to_string(),
            code: self.code().to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ChatError::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ChatError::Forbidden(msg.into())
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ChatError::Conflict(msg),
            StoreError::NotFound(msg) => ChatError::NotFound(msg),
            StoreError::StaleVersion => {
                ChatError::Conflict("Concurrent modification, retry".to_string())
            }
            StoreError::Unavailable(msg) => ChatError::Infrastructure(msg),
        }
    }
}

impl From<CoordError> for ChatError {
    fn from(err: CoordError) -> Self {
        ChatError::Infrastructure(err.to_string())
    }
}

impl From<ChatError> for HttpError {
    fn from(err: ChatError) -> Self {
        let msg = err.to_string();
        match err {
            ChatError::Validation(_) | ChatError::InvalidArgument(_) => {
                HttpError::Validation(vec![GitHubFieldError::new(
                    "Message",
                    "body",
                    "invalid",
                    msg,
                )])
            }
            ChatError::InvalidOperation(_) => HttpError::BadRequest(msg),
            ChatError::NotFound(_) => HttpError::NotFound(msg),
            ChatError::Authentication(_) | ChatError::NotAuthenticated => {
                HttpError::Unauthorized(msg)
            }
            ChatError::Forbidden(_) => HttpError::Forbidden(msg),
            ChatError::Conflict(_) => HttpError::Conflict(msg),
            ChatError::RateLimited => HttpError::TooManyRequests(msg),
            ChatError::Infrastructure(_) => HttpError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_carries_message_and_code() {
        let p = ChatError::NotAuthenticated.payload();
        assert_eq!(p.message, "Not authenticated");
        assert_eq!(p.code, "NOT_AUTHENTICATED");
    }

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        assert_eq!(
            ChatError::from(StoreError::Unavailable("down".into())).code(),
            "INFRASTRUCTURE_ERROR"
        );
        assert_eq!(ChatError::from(StoreError::StaleVersion).code(), "CONFLICT");
        assert_eq!(HttpError::from(ChatError::RateLimited).status_code(), 429);
        assert_eq!(HttpError::from(ChatError::validation("x")).status_code(), 422);
    }
}

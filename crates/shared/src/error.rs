use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Credential failures from the identity gate. All of them are terminal for
/// the request or connection; the caller must obtain a fresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer credential")]
    Missing,
    #[error("malformed bearer credential")]
    Malformed,
    #[error("expired bearer credential")]
    Expired,
    #[error("credential subject is not a known identity")]
    UnknownIdentity,
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        ApiError::new(ErrorCode::Unauthorized, value.to_string())
    }
}

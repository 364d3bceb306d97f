//! Stateless bearer credentials for the HTTP surface and the socket
//! handshake. Tokens are HS256 with the user id as subject; the resolved
//! identity is re-checked against storage so deleted users cannot keep
//! using an old token.

use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use shared::{
    domain::UserId,
    error::{ApiError, AuthError, ErrorCode},
};
use storage::Storage;
use tracing::error;

#[derive(Debug, Clone)]
pub struct TokenVerifier {
    secret: String,
    ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl_seconds,
        }
    }

    pub fn mint(&self, user_id: UserId) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.0.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.ttl_seconds)).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
    }

    /// Checks signature and expiry only; the subject may still be unknown.
    pub fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|error| match error.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Malformed,
        })?;
        data.claims
            .sub
            .parse::<i64>()
            .map(UserId)
            .map_err(|_| AuthError::Malformed)
    }
}

/// Full identity check: token plus a storage lookup of the subject.
/// A storage failure here is a server fault, not a credential problem,
/// and must never read as a rejection to the caller.
pub async fn authenticate(
    storage: &Storage,
    verifier: &TokenVerifier,
    token: &str,
) -> Result<UserId, ApiError> {
    let user_id = verifier.verify(token)?;
    match storage.user_profile(user_id).await {
        Ok(Some(_)) => Ok(user_id),
        Ok(None) => Err(AuthError::UnknownIdentity.into()),
        Err(cause) => {
            error!(user_id = user_id.0, %cause, "identity lookup failed");
            Err(ApiError::new(ErrorCode::Internal, "storage failure"))
        }
    }
}

/// Pulls the credential out of an `Authorization: Bearer ...` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::Missing)?;
    let token = header.strip_prefix("Bearer ").ok_or(AuthError::Malformed)?;
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::Malformed);
    }
    Ok(token)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;

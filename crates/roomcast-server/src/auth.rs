//! Credential validation.
//!
//! Token issuance lives elsewhere; this side only checks tokens presented on
//! the socket upgrade.

use std::collections::HashMap;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use roomcast_core::UserIdentity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the auth collaborator.
///
/// An invalid or expired token is not an error, it is `Ok(None)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Backend could not be reached or answered garbage
    #[error("auth backend unavailable: {0}")]
    Unavailable(String),
}

/// Validates bearer credentials.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Resolve a token to a user. `None` if the token is invalid or expired.
    async fn validate_credential(&self, token: &str) -> Result<Option<UserIdentity>, AuthError>;
}

/// JWT claims accepted by [`JwtAuthenticator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User ID as a decimal string
    pub sub: String,
    /// Display name. Falls back to `sub` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Expiry, seconds since the Unix epoch
    pub exp: u64,
}

/// HS256 JWT validation with a shared secret.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Create an authenticator for tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let validation = Validation::new(Algorithm::HS256);
        Self { key: DecodingKey::from_secret(secret), validation }
    }

    fn identity_from(&self, token: &str) -> Option<UserIdentity> {
        let data = match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(error = %e, "credential rejected");
                return None;
            },
        };

        let Ok(user_id) = data.claims.sub.parse::<u64>() else {
            tracing::debug!(sub = %data.claims.sub, "credential subject is not a user id");
            return None;
        };

        let username = data.claims.username.unwrap_or(data.claims.sub);
        Some(UserIdentity::new(user_id, username))
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn validate_credential(&self, token: &str) -> Result<Option<UserIdentity>, AuthError> {
        Ok(self.identity_from(token))
    }
}

/// Fixed token table. For tests and local development.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, UserIdentity>,
}

impl StaticAuthenticator {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `identity`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: UserIdentity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn validate_credential(&self, token: &str) -> Result<Option<UserIdentity>, AuthError> {
        Ok(self.tokens.get(token).cloned())
    }
}

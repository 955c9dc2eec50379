//! Pluggable connection authentication.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

/// The authenticated party behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("invalid credentials")]
    Invalid,
    #[error("access to document {0} denied")]
    Forbidden(String),
}

/// Decides who is behind an `init` event's `auth` payload.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, doc_id: &str, auth: &Value) -> Result<Identity, AuthError>;
}

/// Trusts the `userId` the client claims. For development and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAnonymous;

impl Authenticator for AllowAnonymous {
    fn authenticate(&self, _doc_id: &str, auth: &Value) -> Result<Identity, AuthError> {
        let user_id = auth
            .get("userId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .unwrap_or("anonymous");
        Ok(Identity {
            user_id: user_id.to_string(),
        })
    }
}

/// Maps bearer tokens (`{"token": "..."}`) to user ids.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, _doc_id: &str, auth: &Value) -> Result<Identity, AuthError> {
        let token = auth
            .get("token")
            .and_then(Value::as_str)
            .ok_or(AuthError::Missing)?;
        self.tokens
            .get(token)
            .map(|user_id| Identity {
                user_id: user_id.clone(),
            })
            .ok_or(AuthError::Invalid)
    }
}

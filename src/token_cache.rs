//! Bearer tokens: requested scopes, token endpoint responses and their cache

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::{RegistryError, Result};

/// Tokens living shorter than this are treated as living this long, see
/// https://docs.docker.com/reference/api/registry/auth/#token-response-fields
pub(crate) const MINIMUM_TOKEN_LIFETIME_SECS: i64 = 60;

/// Desired operation for registry authentication
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegistryOperation {
    /// Authenticate for push operations
    Push,
    /// Authenticate for pull operations
    Pull,
}

impl fmt::Display for RegistryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryOperation::Push => f.write_str("push"),
            RegistryOperation::Pull => f.write_str("pull"),
        }
    }
}

/// Access requested on one repository, rendered as `repository:<name>:<actions>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryScope {
    /// Repository name, e.g. `library/busybox`
    pub repository: String,
    /// Requested actions
    pub actions: Vec<RegistryOperation>,
}

impl RepositoryScope {
    /// Pull and push access to `repository`
    pub fn pull_push(repository: impl Into<String>) -> Self {
        RepositoryScope {
            repository: repository.into(),
            actions: vec![RegistryOperation::Pull, RegistryOperation::Push],
        }
    }
}

impl fmt::Display for RepositoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions: Vec<String> = self.actions.iter().map(|a| a.to_string()).collect();
        write!(f, "repository:{}:{}", self.repository, actions.join(","))
    }
}

/// Body returned by a token endpoint during the bearer handshake.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    refresh_token: String,
}

impl TokenResponse {
    pub(crate) fn decode(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| RegistryError::TokenDecode(e.to_string()))
    }

    /// Turns the response into a token, `now` standing in for a missing `issued_at`
    pub(crate) fn into_token(self, now: DateTime<Utc>) -> Result<RegistryToken> {
        let value = if !self.token.is_empty() {
            self.token
        } else if !self.access_token.is_empty() {
            self.access_token
        } else {
            return Err(RegistryError::TokenDecode(
                "response carries neither token nor access_token".to_string(),
            ));
        };
        let lifetime = self.expires_in.max(MINIMUM_TOKEN_LIFETIME_SECS);
        let issued_at = self.issued_at.unwrap_or(now);
        Ok(RegistryToken {
            value,
            expiration: issued_at + Duration::seconds(lifetime),
            refresh_token: Some(self.refresh_token).filter(|t| !t.is_empty()),
        })
    }
}

/// A token granted during the bearer handshake
#[derive(Clone)]
pub(crate) struct RegistryToken {
    value: String,
    pub expiration: DateTime<Utc>,
    pub refresh_token: Option<String>,
}

impl RegistryToken {
    pub fn token(&self) -> &str {
        &self.value
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }
}

impl fmt::Debug for RegistryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = String::from("<redacted>");
        f.debug_struct("RegistryToken")
            .field("value", &redacted)
            .field("expiration", &self.expiration)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| &redacted),
            )
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TokenCacheKey {
    pub realm: String,
    pub service: String,
    pub scope: String,
}

#[derive(Clone, Default)]
pub(crate) struct TokenCache {
    // (realm, service, scope) -> token
    tokens: Arc<RwLock<BTreeMap<TokenCacheKey, RegistryToken>>>,
}

impl TokenCache {
    pub(crate) async fn insert(&self, key: TokenCacheKey, token: RegistryToken) {
        debug!(%key.realm, %key.service, %key.scope, expiration = %token.expiration, "Inserting token");
        self.tokens.write().await.insert(key, token);
    }

    pub(crate) async fn get(&self, key: &TokenCacheKey) -> Option<RegistryToken> {
        match self.tokens.read().await.get(key) {
            Some(token) if token.is_expired(Utc::now()) => {
                debug!(%key.realm, %key.service, %key.scope, expiration = %token.expiration, miss = false, expired = true, "Fetching token");
                None
            }
            Some(token) => {
                debug!(%key.realm, %key.service, %key.scope, expiration = %token.expiration, miss = false, expired = false, "Fetching token");
                Some(token.clone())
            }
            None => {
                debug!(%key.realm, %key.service, %key.scope, miss = true, "Fetching token");
                None
            }
        }
    }
}

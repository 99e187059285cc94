//! Types for working with registry access secrets

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use http::header::{HeaderValue, AUTHORIZATION};
use reqwest::Url;
use tracing::debug;

/// Credentials used to access a registry. Never persisted.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// User name for HTTP Basic authentication or the token handshake
    pub username: String,
    /// Password matching `username`
    pub password: String,
    /// Identity (refresh) token handed out by a previous login
    pub identity_token: String,
}

impl Credentials {
    /// Username/password credentials
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
            identity_token: String::new(),
        }
    }

    /// Credentials carrying nothing, for anonymous access
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// True if both a username and a password are set
    pub fn has_basic(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = "<redacted>";
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &redacted)
            .field("identity_token", &redacted)
            .finish()
    }
}

/// Source of credentials consulted by the authentication handlers
pub trait CredentialStore: Send + Sync {
    /// Username and password to use against `url`
    fn basic(&self, url: &Url) -> (String, String);

    /// Refresh token to use against `url` for `service`
    fn refresh_token(&self, url: &Url, service: &str) -> String;

    /// Records a refresh token issued by `service`
    fn set_refresh_token(&self, url: &Url, service: &str, token: &str);
}

/// Exposes a fixed set of [`Credentials`]
#[derive(Debug, Clone)]
pub struct StaticCredentialStore {
    credentials: Credentials,
}

impl StaticCredentialStore {
    /// Store answering with `credentials` for every URL
    pub fn new(credentials: Credentials) -> Self {
        StaticCredentialStore { credentials }
    }
}

impl CredentialStore for StaticCredentialStore {
    fn basic(&self, _url: &Url) -> (String, String) {
        (
            self.credentials.username.clone(),
            self.credentials.password.clone(),
        )
    }

    fn refresh_token(&self, _url: &Url, _service: &str) -> String {
        self.credentials.identity_token.clone()
    }

    // Rotated tokens only live as long as the transport, so nothing is kept.
    fn set_refresh_token(&self, _url: &Url, service: &str, _token: &str) {
        debug!(%service, "Discarding refreshed token");
    }
}

/// Value of an `Authorization` header for HTTP Basic authentication
pub(crate) fn basic_auth_value(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", username, password))
    )
}

pub(crate) trait Authenticable {
    fn apply_basic_auth(&mut self, username: &str, password: &str);
    fn apply_bearer_auth(&mut self, token: &str);
}

impl Authenticable for reqwest::Request {
    fn apply_basic_auth(&mut self, username: &str, password: &str) {
        if let Ok(mut value) = HeaderValue::from_str(&basic_auth_value(username, password)) {
            value.set_sensitive(true);
            self.headers_mut().insert(AUTHORIZATION, value);
        }
    }

    fn apply_bearer_auth(&mut self, token: &str) {
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                self.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(_) => debug!("Bearer token is not a valid header value, leaving request as is"),
        }
    }
}

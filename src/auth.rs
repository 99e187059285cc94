//! Transports that authenticate every request against a registry
//!
//! [`build_transport`] pings the registry, picks HTTP Basic or the bearer token
//! handshake and returns an [`AuthTransport`] decorating the base transport.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::header::AUTHORIZATION;
use reqwest::Url;
use tracing::debug;

use crate::challenge::{Challenge, ChallengeManager};
use crate::errors::{BoxError, NetworkError, RegistryError, Result};
use crate::ping::ping;
use crate::secrets::{
    basic_auth_value, Authenticable, CredentialStore, Credentials, StaticCredentialStore,
};
use crate::sender::{self, SendOptions};
use crate::token_cache::{
    RegistryToken, RepositoryScope, TokenCache, TokenCacheKey, TokenResponse,
};
use crate::transport::Transport;

/// Registries under this domain get HTTP Basic whenever a username and a
/// password are known, their credential helpers hand out passwords that only
/// work with Basic.
///
/// Matched against the address as given. Other managed registries with the same
/// quirk are not covered.
pub const FORCED_BASIC_AUTH_SUFFIX: &str = "amazonaws.com";

/// Client identifier sent to token endpoints
pub const TOKEN_CLIENT_ID: &str = "docker";

/// Authentication scheme applied by an [`AuthTransport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Basic` with the stored username and password
    Basic,
    /// `Authorization: Bearer` with a token obtained from the challenge realm
    Bearer,
}

impl AuthScheme {
    /// Picks the scheme for `address`.
    ///
    /// Basic only if both username and password are set and the address ends
    /// with [`FORCED_BASIC_AUTH_SUFFIX`], Bearer otherwise.
    pub fn select(address: &str, credentials: &Credentials) -> Self {
        if credentials.has_basic() && address.ends_with(FORCED_BASIC_AUTH_SUFFIX) {
            AuthScheme::Basic
        } else {
            AuthScheme::Bearer
        }
    }
}

/// Authorizes requests for one challenge scheme
pub trait AuthenticationHandler: Send + Sync {
    /// Scheme of the challenges handled, compared case-insensitively
    fn scheme(&self) -> &str;

    /// Adds credentials answering `challenge` to `request`
    fn authorize_request<'a>(
        &'a self,
        request: &'a mut reqwest::Request,
        challenge: &'a Challenge,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Answers `Basic` challenges with the stored username and password
pub struct BasicHandler {
    credentials: Arc<dyn CredentialStore>,
}

impl BasicHandler {
    /// Handler reading from `credentials`
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        BasicHandler { credentials }
    }
}

impl AuthenticationHandler for BasicHandler {
    fn scheme(&self) -> &str {
        "basic"
    }

    fn authorize_request<'a>(
        &'a self,
        request: &'a mut reqwest::Request,
        _challenge: &'a Challenge,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let (username, password) = self.credentials.basic(request.url());
            if username.is_empty() || password.is_empty() {
                return Err(RegistryError::NoBasicAuthCredentials);
            }
            request.apply_basic_auth(&username, &password);
            Ok(())
        }
        .boxed()
    }
}

/// Answers `Bearer` challenges with a token fetched from the challenge realm
pub struct TokenHandler {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    scopes: Vec<RepositoryScope>,
    client_id: String,
    tokens: TokenCache,
}

impl TokenHandler {
    /// Handler requesting `scopes`, talking to the token endpoint through `transport`
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        scopes: Vec<RepositoryScope>,
    ) -> Self {
        TokenHandler {
            transport,
            credentials,
            scopes,
            client_id: TOKEN_CLIENT_ID.to_string(),
            tokens: TokenCache::default(),
        }
    }

    async fn token(&self, challenge: &Challenge) -> Result<String> {
        let realm = challenge
            .parameter("realm")
            .ok_or_else(|| RegistryError::InvalidRealm("missing realm".to_string()))?;
        let realm = Url::parse(realm)
            .map_err(|e| RegistryError::InvalidRealm(format!("{}: {}", realm, e)))?;
        let service = challenge.parameter("service").unwrap_or_default();
        let scopes: Vec<String> = self.scopes.iter().map(|s| s.to_string()).collect();

        let key = TokenCacheKey {
            realm: realm.to_string(),
            service: service.to_string(),
            scope: scopes.join(" "),
        };
        if let Some(token) = self.tokens.get(&key).await {
            return Ok(token.token().to_string());
        }

        let token = self.fetch_token(&realm, service, &scopes).await?;
        let value = token.token().to_string();
        self.tokens.insert(key, token).await;
        Ok(value)
    }

    async fn fetch_token(
        &self,
        realm: &Url,
        service: &str,
        scopes: &[String],
    ) -> Result<RegistryToken> {
        if !self.credentials.refresh_token(realm, service).is_empty() {
            debug!(%service, "Ignoring identity token, only the basic token handshake is supported");
        }

        // Credentials must never reach the realm over plain http.
        let mut options = SendOptions::new()
            .transport(self.transport.clone())
            .disable_http_fallback();
        let (username, password) = self.credentials.basic(realm);
        let account = if !username.is_empty() && !password.is_empty() {
            options = options.header(
                AUTHORIZATION.as_str(),
                basic_auth_value(&username, &password),
            );
            Some(username)
        } else {
            None
        };

        let mut url = realm.clone();
        {
            let mut query = url.query_pairs_mut();
            if !service.is_empty() {
                query.append_pair("service", service);
            }
            for scope in scopes {
                query.append_pair("scope", scope);
            }
            query.append_pair("client_id", &self.client_id);
            if let Some(account) = &account {
                query.append_pair("account", account);
            }
        }

        debug!(%realm, %service, ?scopes, "Making authentication call");
        let response = sender::get(url.as_str(), options).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| RegistryError::Network(NetworkError::new(e)))?;
        let token = TokenResponse::decode(&body)?.into_token(Utc::now())?;
        if let Some(refresh_token) = &token.refresh_token {
            self.credentials
                .set_refresh_token(realm, service, refresh_token);
        }
        debug!(%realm, %service, expiration = %token.expiration, "Obtained registry token");
        Ok(token)
    }
}

impl AuthenticationHandler for TokenHandler {
    fn scheme(&self) -> &str {
        "bearer"
    }

    fn authorize_request<'a>(
        &'a self,
        request: &'a mut reqwest::Request,
        challenge: &'a Challenge,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let token = self.token(challenge).await?;
            request.apply_bearer_auth(&token);
            Ok(())
        }
        .boxed()
    }
}

/// Applies handlers to requests according to the challenges a registry advertised
pub struct Authorizer {
    challenges: ChallengeManager,
    handlers: Vec<Box<dyn AuthenticationHandler>>,
}

impl Authorizer {
    /// Authorizer consuming the challenges of a ping
    pub fn new(challenges: ChallengeManager, handlers: Vec<Box<dyn AuthenticationHandler>>) -> Self {
        Authorizer {
            challenges,
            handlers,
        }
    }

    /// Lets every handler whose scheme was challenged for the request's
    /// registry authorize it. Without a matching challenge the request is left
    /// untouched.
    pub async fn modify_request(&self, request: &mut reqwest::Request) -> Result<()> {
        let mut root = request.url().clone();
        root.set_path("/v2/");
        root.set_query(None);
        root.set_fragment(None);

        let challenges = self.challenges.challenges(&root);
        for handler in &self.handlers {
            for challenge in challenges {
                if challenge.is_scheme(handler.scheme()) {
                    handler.authorize_request(request, challenge).await?;
                }
            }
        }
        Ok(())
    }
}

/// A transport that authenticates every request before handing it to the
/// base transport.
pub struct AuthTransport {
    base: Arc<dyn Transport>,
    authorizer: Authorizer,
    scheme: AuthScheme,
}

impl AuthTransport {
    /// Decorates `base` with `authorizer`
    pub fn new(base: Arc<dyn Transport>, authorizer: Authorizer, scheme: AuthScheme) -> Self {
        AuthTransport {
            base,
            authorizer,
            scheme,
        }
    }

    /// The scheme this transport was built for
    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }
}

impl Transport for AuthTransport {
    fn round_trip(
        &self,
        mut request: reqwest::Request,
    ) -> BoxFuture<'_, std::result::Result<reqwest::Response, BoxError>> {
        async move {
            self.authorizer.modify_request(&mut request).await?;
            self.base.round_trip(request).await
        }
        .boxed()
    }
}

/// Builds a transport authenticating against the registry at `address`.
///
/// The registry is pinged through `base` first; any failure there is fatal.
/// The returned transport attaches either HTTP Basic credentials or a bearer
/// token scoped to `repository:<repository>:pull,push` to every request.
pub async fn build_transport(
    address: &str,
    repository: &str,
    base: Arc<dyn Transport>,
    credentials: Credentials,
) -> Result<AuthTransport> {
    let challenges = ping(address, base.clone())
        .await
        .map_err(RegistryError::ping)?;

    let scheme = AuthScheme::select(address, &credentials);
    debug!(%address, %repository, ?scheme, "Selected authentication scheme");

    let store: Arc<dyn CredentialStore> = Arc::new(StaticCredentialStore::new(credentials));
    let handler: Box<dyn AuthenticationHandler> = match scheme {
        AuthScheme::Basic => Box::new(BasicHandler::new(store)),
        AuthScheme::Bearer => Box::new(TokenHandler::new(
            base.clone(),
            store,
            vec![RepositoryScope::pull_push(repository)],
        )),
    };

    Ok(AuthTransport::new(
        base,
        Authorizer::new(challenges, vec![handler]),
        scheme,
    ))
}

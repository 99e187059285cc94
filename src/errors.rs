//! Errors related to sending requests to registries and negotiating authentication

use std::collections::HashSet;
use std::error::Error as StdError;
use std::time::Duration;

use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

/// Boxed error produced by a [`Transport`](crate::transport::Transport)
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Result type returned by this crate
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Upper bound on the number of response body bytes kept by a [`StatusError`]
pub const MAX_RESPONSE_DUMP_BYTES: usize = 64 * 1024;

lazy_static! {
    /// Statuses that are retried whenever the caller opts into retries.
    static ref RETRYABLE_CODES: HashSet<StatusCode> = [
        StatusCode::TOO_MANY_REQUESTS,
        StatusCode::BAD_GATEWAY,
        StatusCode::SERVICE_UNAVAILABLE,
        StatusCode::GATEWAY_TIMEOUT,
    ]
    .into_iter()
    .collect();
}

/// Errors that can be raised while sending requests or building transports
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The given URL could not be parsed or rewritten
    #[error("parse url {url:?}: {reason}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Why it was rejected
        reason: String,
    },
    /// A configured header name or value is not valid HTTP
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
    /// An HTTP client could not be built from the TLS configuration
    #[error("build http client: {0}")]
    ClientBuild(#[from] reqwest::Error),
    /// No response was obtained
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// A response was obtained but its status was not accepted
    #[error(transparent)]
    Status(#[from] StatusError),
    /// The registry did not advertise `registry/2.0`
    #[error("registry is not v2")]
    NotV2Registry,
    /// Probing the registry failed
    #[error("ping v2 registry: {source}")]
    Ping {
        /// The underlying failure
        #[source]
        source: Box<RegistryError>,
    },
    /// The `WWW-Authenticate` header could not be parsed
    #[error("add response: {0}")]
    InvalidChallenge(String),
    /// The credential store holds no username/password pair
    #[error("no basic auth credentials")]
    NoBasicAuthCredentials,
    /// The realm advertised by a bearer challenge is unusable
    #[error("invalid token auth challenge realm: {0}")]
    InvalidRealm(String),
    /// The token endpoint answered with something that isn't a token
    #[error("unable to decode token response: {0}")]
    TokenDecode(String),
}

impl RegistryError {
    /// Wraps the error with the context of a failed registry probe
    pub(crate) fn ping(source: RegistryError) -> Self {
        RegistryError::Ping {
            source: Box::new(source),
        }
    }

    /// See [`is_status`]
    pub fn is_status(&self, status: StatusCode) -> bool {
        is_status(self, status)
    }

    /// See [`is_network_error`]
    pub fn is_network_error(&self) -> bool {
        is_network_error(self)
    }

    /// See [`is_retryable`]
    pub fn is_retryable(&self) -> bool {
        is_retryable(self)
    }

    /// Returns the status error carried by this error, if any
    pub fn status_error(&self) -> Option<&StatusError> {
        find_status_error(self)
    }
}

/// Occurs if an HTTP response has an unexpected status code.
#[derive(Debug, Clone)]
pub struct StatusError {
    /// Method of the request
    pub method: Method,
    /// URL of the request
    pub url: String,
    /// Received status
    pub status: StatusCode,
    /// Received headers
    pub headers: HeaderMap,
    /// Body of the response, truncated to [`MAX_RESPONSE_DUMP_BYTES`]
    pub response_dump: String,
}

impl StatusError {
    /// Builds a status error out of `response`, draining and closing its body.
    pub async fn from_response(method: Method, url: &str, mut response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let mut dump: Vec<u8> = Vec::new();
        let response_dump = loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = MAX_RESPONSE_DUMP_BYTES - dump.len();
                    dump.extend_from_slice(&chunk[..chunk.len().min(room)]);
                    if dump.len() == MAX_RESPONSE_DUMP_BYTES {
                        break String::from_utf8_lossy(&dump).into_owned();
                    }
                }
                Ok(None) => break String::from_utf8_lossy(&dump).into_owned(),
                Err(e) => break format!("failed to dump response: {}", e),
            }
        };
        // Dropping the response here releases the connection.
        drop(response);
        StatusError {
            method,
            url: url.to_string(),
            status,
            headers,
            response_dump,
        }
    }
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.response_dump.is_empty() {
            write!(f, "{} {} {}", self.method, self.url, self.status.as_u16())
        } else {
            write!(
                f,
                "{} {} {}: {}",
                self.method,
                self.url,
                self.status.as_u16(),
                self.response_dump
            )
        }
    }
}

impl StdError for StatusError {}

/// Occurs on any failure while trying to send the HTTP request, before a
/// response was obtained, e.g. the given host is unresponsive.
#[derive(Error, Debug)]
#[error("network error: {source}")]
pub struct NetworkError {
    #[source]
    source: BoxError,
}

impl NetworkError {
    /// Wraps a transport level failure
    pub fn new(source: impl Into<BoxError>) -> Self {
        NetworkError {
            source: source.into(),
        }
    }

    /// Returns true if the attempt was aborted through its cancellation token
    pub fn is_cancelled(&self) -> bool {
        self.source.is::<Cancelled>()
    }

    /// Returns true if the attempt ran out of time
    pub fn is_timeout(&self) -> bool {
        self.source.is::<TimedOut>()
    }
}

/// The request was cancelled by the caller
#[derive(Error, Debug, Clone, Copy)]
#[error("request cancelled")]
pub struct Cancelled;

/// The request did not complete within its timeout
#[derive(Error, Debug, Clone, Copy)]
#[error("request timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Returns true if `status` is one of the statuses retried by default
pub fn is_retryable_code(status: StatusCode) -> bool {
    RETRYABLE_CODES.contains(&status)
}

fn find_status_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a StatusError> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(status_error) = e.downcast_ref::<StatusError>() {
            return Some(status_error);
        }
        if let Some(RegistryError::Status(status_error)) = e.downcast_ref::<RegistryError>() {
            return Some(status_error);
        }
        current = e.source();
    }
    None
}

/// Returns true if `err`, or any error it wraps, is a [`StatusError`] of `status`.
pub fn is_status(err: &(dyn StdError + 'static), status: StatusCode) -> bool {
    find_status_error(err).is_some_and(|e| e.status == status)
}

/// Returns true if `err`, or any error it wraps, is a [`NetworkError`].
pub fn is_network_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<NetworkError>()
            || matches!(
                e.downcast_ref::<RegistryError>(),
                Some(RegistryError::Network(_))
            )
        {
            return true;
        }
        current = e.source();
    }
    false
}

/// Returns true if `err` carries a status that is retried by default.
pub fn is_retryable(err: &(dyn StdError + 'static)) -> bool {
    find_status_error(err).is_some_and(|e| is_retryable_code(e.status))
}

/// Returns true if `err` is a "created" (201) status error
pub fn is_created(err: &(dyn StdError + 'static)) -> bool {
    is_status(err, StatusCode::CREATED)
}

/// Returns true if `err` is a "not found" (404) status error
pub fn is_not_found(err: &(dyn StdError + 'static)) -> bool {
    is_status(err, StatusCode::NOT_FOUND)
}

/// Returns true if `err` is a "conflict" (409) status error
pub fn is_conflict(err: &(dyn StdError + 'static)) -> bool {
    is_status(err, StatusCode::CONFLICT)
}

/// Returns true if `err` is an "accepted" (202) status error
pub fn is_accepted(err: &(dyn StdError + 'static)) -> bool {
    is_status(err, StatusCode::ACCEPTED)
}

/// Returns true if `err` is a "forbidden" (403) status error
pub fn is_forbidden(err: &(dyn StdError + 'static)) -> bool {
    is_status(err, StatusCode::FORBIDDEN)
}

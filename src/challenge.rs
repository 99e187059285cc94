//! Authentication challenges advertised by registries through `WWW-Authenticate`

use std::collections::HashMap;

use http::header::WWW_AUTHENTICATE;
use http::{HeaderMap, StatusCode};
use http_auth::{parser::ChallengeParser, ChallengeRef};
use reqwest::Url;
use unicase::UniCase;

use crate::errors::{RegistryError, Result};

/// One challenge: a scheme and its parameters, both compared case-insensitively
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    scheme: UniCase<String>,
    parameters: HashMap<UniCase<String>, String>,
}

impl Challenge {
    /// The authentication scheme, e.g. `Bearer`
    pub fn scheme(&self) -> &str {
        self.scheme.as_str()
    }

    /// True if the challenge uses `scheme`
    pub fn is_scheme(&self, scheme: &str) -> bool {
        self.scheme == UniCase::new(scheme.to_string())
    }

    /// Value of the parameter `name`, e.g. `realm`
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(&UniCase::new(name.to_string()))
            .map(String::as_str)
    }
}

impl From<&ChallengeRef<'_>> for Challenge {
    fn from(value: &ChallengeRef<'_>) -> Self {
        let parameters = value
            .params
            .iter()
            .map(|(k, v)| (UniCase::new(k.to_string()), v.to_unescaped()))
            .collect();
        Challenge {
            scheme: UniCase::new(value.scheme.to_string()),
            parameters,
        }
    }
}

/// Parses every challenge of every `WWW-Authenticate` header in `headers`
pub fn parse_challenges(headers: &HeaderMap) -> Result<Vec<Challenge>> {
    let mut challenges = Vec::new();
    for value in headers.get_all(WWW_AUTHENTICATE) {
        let value = value.to_str().map_err(|e| {
            RegistryError::InvalidChallenge(format!(
                "cannot convert header value to string: {:?}",
                e
            ))
        })?;
        for challenge in ChallengeParser::new(value) {
            let challenge = challenge.map_err(|e| {
                RegistryError::InvalidChallenge(format!(
                    "malformed challenge {:?}: {:?}",
                    value, e
                ))
            })?;
            challenges.push(Challenge::from(&challenge));
        }
    }
    Ok(challenges)
}

/// Tracks the challenges seen per endpoint.
#[derive(Clone, Debug, Default)]
pub struct ChallengeManager {
    challenges: HashMap<String, Vec<Challenge>>,
}

impl ChallengeManager {
    /// An empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the challenges of a response obtained from `url`. Only
    /// `401 Unauthorized` responses carry challenges, others are ignored.
    pub fn add_response(&mut self, url: &Url, status: StatusCode, headers: &HeaderMap) -> Result<()> {
        if status != StatusCode::UNAUTHORIZED {
            return Ok(());
        }
        let challenges = parse_challenges(headers)?;
        self.challenges.insert(endpoint_key(url), challenges);
        Ok(())
    }

    /// Challenges recorded for `endpoint`
    pub fn challenges(&self, endpoint: &Url) -> &[Challenge] {
        self.challenges
            .get(&endpoint_key(endpoint))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// True if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}

// Host case and implicit default ports must not produce distinct entries.
fn endpoint_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let port = url
        .port_or_known_default()
        .map(|p| format!(":{}", p))
        .unwrap_or_default();
    format!("{}://{}{}{}", url.scheme(), host, port, url.path())
}

//! Probing a registry for its API version and authentication challenges

use std::fmt;
use std::sync::Arc;

use http::{HeaderMap, StatusCode};
use reqwest::Url;
use tracing::debug;

use crate::challenge::ChallengeManager;
use crate::errors::{RegistryError, Result};
use crate::sender::{self, SendOptions};
use crate::transport::Transport;

/// Header through which registries advertise the API versions they support
pub const REGISTRY_VERSION_HEADER: &str = "Docker-Distribution-Api-Version";

/// An API version advertised by a registry, e.g. `registry/2.0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiVersion {
    /// Kind of API, `registry` for the distribution API
    pub kind: String,
    /// Version of that API
    pub version: String,
}

impl ApiVersion {
    /// The only version this crate talks to
    pub fn registry_v2() -> Self {
        ApiVersion {
            kind: "registry".to_string(),
            version: "2.0".to_string(),
        }
    }

    /// Parses `kind/version`. A value without `/` only has a kind.
    pub fn parse(value: &str) -> Self {
        match value.split_once('/') {
            Some((kind, version)) => ApiVersion {
                kind: kind.to_string(),
                version: version.to_string(),
            },
            None => ApiVersion {
                kind: value.to_string(),
                version: String::new(),
            },
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.version)
    }
}

/// Every API version listed in the (possibly repeated) `header` of `headers`
pub fn api_versions(headers: &HeaderMap, header: &str) -> Vec<ApiVersion> {
    headers
        .get_all(header)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(str::split_whitespace)
        .map(ApiVersion::parse)
        .collect()
}

/// Probes `https://<address>/v2/` through `transport`.
///
/// Succeeds if the registry answers with 200 or 401 and advertises
/// `registry/2.0`, returning the challenges carried by the response.
pub async fn ping(address: &str, transport: Arc<dyn Transport>) -> Result<ChallengeManager> {
    let url = format!("https://{}/v2/", address);
    let response = sender::get(
        &url,
        SendOptions::new()
            .tls_transport(transport)
            .accepted_codes([StatusCode::OK, StatusCode::UNAUTHORIZED])
            .disable_http_fallback(),
    )
    .await?;

    let status = response.status();
    let headers = response.headers().clone();
    drop(response);

    let versions = api_versions(&headers, REGISTRY_VERSION_HEADER);
    debug!(%address, %status, ?versions, "Pinged registry");
    if !versions.contains(&ApiVersion::registry_v2()) {
        return Err(RegistryError::NotV2Registry);
    }

    let endpoint = Url::parse(&url).map_err(|e| RegistryError::InvalidUrl {
        url: url.clone(),
        reason: e.to_string(),
    })?;
    let mut challenges = ChallengeManager::new();
    challenges.add_response(&endpoint, status, &headers)?;
    Ok(challenges)
}

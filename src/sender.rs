//! Sending HTTP requests with status classification and opt-in retries
//!
//! ```no_run
//! use http::StatusCode;
//! use registry_transport::retry::RetryPolicy;
//! use registry_transport::sender::{self, SendOptions};
//!
//! # async fn run() -> registry_transport::errors::Result<()> {
//! let _response = sender::get(
//!     "https://registry.example.com/v2/",
//!     SendOptions::new()
//!         .accepted_codes([StatusCode::OK, StatusCode::UNAUTHORIZED])
//!         .retry(RetryPolicy::default()),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use http::{Method, StatusCode};
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{
    is_retryable_code, Cancelled, NetworkError, RegistryError, Result, StatusError, TimedOut,
};
use crate::retry::RetryPolicy;
use crate::transport::{TlsConfig, Transport};

/// Default timeout of a single attempt
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

lazy_static! {
    static ref DEFAULT_CLIENT: reqwest::Client = reqwest::Client::new();
}

/// Settings for one call to [`send`].
///
/// Every setter consumes the options and returns the updated copy, so a set of
/// options is assembled in one expression and then handed over to `send`.
pub struct SendOptions {
    body: Option<Bytes>,
    timeout: Duration,
    accepted_codes: HashSet<StatusCode>,
    headers: HashMap<String, String>,
    redirect: Option<reqwest::redirect::Policy>,
    retry: RetryPolicy,
    transport: Option<Arc<dyn Transport>>,
    cancellation: CancellationToken,
    // Overrides the whole client, redirect policy included. Meant for tests.
    client: Option<reqwest::Client>,
    // Replaces the scheme of the URL given to `send`.
    scheme: Option<String>,
    http_fallback: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            body: None,
            timeout: DEFAULT_TIMEOUT,
            accepted_codes: HashSet::from([StatusCode::OK]),
            headers: HashMap::new(),
            redirect: None,
            retry: RetryPolicy::disabled(),
            transport: None,
            cancellation: CancellationToken::new(),
            client: None,
            scheme: None,
            http_fallback: false,
        }
    }
}

impl SendOptions {
    /// Options with every default in place
    pub fn new() -> Self {
        Self::default()
    }

    /// Request body. Without one the request carries `Content-Length: 0`
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Time allowed for each attempt
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Statuses considered successful. An empty set keeps the current one.
    pub fn accepted_codes(mut self, codes: impl IntoIterator<Item = StatusCode>) -> Self {
        let codes: HashSet<StatusCode> = codes.into_iter().collect();
        if !codes.is_empty() {
            self.accepted_codes = codes;
        }
        self
    }

    /// Replaces all request headers
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Sets a single request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Redirect policy of the client built by `send`. A supplied transport or
    /// client follows its own policy, `send` logs a warning when both are set.
    pub fn redirect(mut self, policy: reqwest::redirect::Policy) -> Self {
        self.redirect = Some(policy);
        self
    }

    /// Enables retries
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Sends through `transport`
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sends through `transport` and forces the `https` scheme
    pub fn tls_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self.scheme = Some("https".to_string());
        self
    }

    /// Sends through a transport built from `config` and forces the `https`
    /// scheme. `None` leaves the options untouched.
    pub fn tls(self, config: Option<&TlsConfig>) -> Result<Self> {
        match config {
            Some(config) => Ok(self.tls_transport(config.build_transport()?)),
            None => Ok(self),
        }
    }

    /// Aborts the in-flight attempt and any pending retry once `token` is cancelled
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Sends with `client` as is. Meant for tests
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Rewrites the scheme of the target URL, e.g. from `http` to `https`
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    /// Makes one more attempt over plain `http` when an `https` request got no
    /// response once retries are exhausted. Off by default.
    pub fn enable_http_fallback(mut self) -> Self {
        self.http_fallback = true;
        self
    }

    /// Never retries over plain `http`
    pub fn disable_http_fallback(mut self) -> Self {
        self.http_fallback = false;
        self
    }

    fn resolve_transport(&mut self) -> Result<Arc<dyn Transport>> {
        if self.redirect.is_some() && (self.client.is_some() || self.transport.is_some()) {
            warn!("Ignoring redirect policy, the supplied transport follows its own");
        }
        if let Some(client) = &self.client {
            return Ok(Arc::new(client.clone()));
        }
        if let Some(transport) = &self.transport {
            return Ok(transport.clone());
        }
        match self.redirect.take() {
            Some(policy) => Ok(Arc::new(
                reqwest::Client::builder().redirect(policy).build()?,
            )),
            None => Ok(Arc::new(DEFAULT_CLIENT.clone())),
        }
    }

    fn should_retry(&self, status: StatusCode) -> bool {
        (is_retryable_code(status) && !self.accepted_codes.contains(&status))
            || self.retry.is_extra_code(status)
    }
}

/// Sends an HTTP request.
///
/// Returns the response if its status is accepted, a
/// [`StatusError`] if it isn't, and a [`NetworkError`] if no response could be
/// obtained. With a retry policy, network failures and retryable statuses are
/// attempted again until the backoff says stop; the last outcome is returned.
pub async fn send(method: Method, url: &str, options: SendOptions) -> Result<reqwest::Response> {
    let mut url = Url::parse(url).map_err(|e| RegistryError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let mut opts = options;
    if let Some(scheme) = &opts.scheme {
        set_scheme(&mut url, scheme)?;
    }
    let transport = opts.resolve_transport()?;

    let mut attempt: u32 = 0;
    let outcome = loop {
        attempt += 1;
        let request = new_request(&method, &url, &opts)?;
        debug!(%method, %url, attempt, "Sending request");
        let outcome = execute(transport.as_ref(), request, &opts).await;
        let retry = match &outcome {
            Ok(response) => opts.should_retry(response.status()),
            Err(e) => !e.is_cancelled(),
        };
        if !retry {
            break outcome;
        }
        let Some(delay) = opts.retry.backoff.next_backoff() else {
            break outcome;
        };
        match &outcome {
            Ok(response) => {
                debug!(%method, %url, attempt, status = %response.status(), ?delay, "Retrying request")
            }
            Err(error) => debug!(%method, %url, attempt, %error, ?delay, "Retrying request"),
        }
        drop(outcome);
        tokio::select! {
            biased;
            _ = opts.cancellation.cancelled() => break Err(NetworkError::new(Cancelled)),
            _ = tokio::time::sleep(delay) => {}
        }
    };

    let response = match outcome {
        Ok(response) => response,
        Err(error) if !error.is_cancelled() && url.scheme() == "https" && opts.http_fallback => {
            let mut http_url = url.clone();
            set_scheme(&mut http_url, "http")?;
            warn!(%method, %url, %error, "Request failed over https, falling back to http");
            let request = new_request(&method, &http_url, &opts)?;
            match execute(transport.as_ref(), request, &opts).await {
                Ok(response) => {
                    url = http_url;
                    response
                }
                Err(_) => return Err(error.into()),
            }
        }
        Err(error) => return Err(error.into()),
    };

    if !opts.accepted_codes.contains(&response.status()) {
        return Err(StatusError::from_response(method, url.as_str(), response)
            .await
            .into());
    }
    Ok(response)
}

/// Sends a GET request
pub async fn get(url: &str, options: SendOptions) -> Result<reqwest::Response> {
    send(Method::GET, url, options).await
}

/// Sends a HEAD request
pub async fn head(url: &str, options: SendOptions) -> Result<reqwest::Response> {
    send(Method::HEAD, url, options).await
}

/// Sends a POST request
pub async fn post(url: &str, options: SendOptions) -> Result<reqwest::Response> {
    send(Method::POST, url, options).await
}

/// Sends a PUT request
pub async fn put(url: &str, options: SendOptions) -> Result<reqwest::Response> {
    send(Method::PUT, url, options).await
}

/// Sends a PATCH request
pub async fn patch(url: &str, options: SendOptions) -> Result<reqwest::Response> {
    send(Method::PATCH, url, options).await
}

/// Sends a DELETE request
pub async fn delete(url: &str, options: SendOptions) -> Result<reqwest::Response> {
    send(Method::DELETE, url, options).await
}

fn set_scheme(url: &mut Url, scheme: &str) -> Result<()> {
    url.set_scheme(scheme)
        .map_err(|_| RegistryError::InvalidUrl {
            url: url.to_string(),
            reason: format!("cannot switch scheme to {}", scheme),
        })
}

fn new_request(method: &Method, url: &Url, opts: &SendOptions) -> Result<reqwest::Request> {
    let mut request = reqwest::Request::new(method.clone(), url.clone());
    *request.timeout_mut() = Some(opts.timeout);
    match &opts.body {
        Some(body) => *request.body_mut() = Some(body.clone().into()),
        None => {
            request
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        }
    }
    for (key, val) in &opts.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| RegistryError::InvalidHeader(key.clone()))?;
        let value =
            HeaderValue::from_str(val).map_err(|_| RegistryError::InvalidHeader(key.clone()))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

async fn execute(
    transport: &dyn Transport,
    request: reqwest::Request,
    opts: &SendOptions,
) -> std::result::Result<reqwest::Response, NetworkError> {
    if opts.cancellation.is_cancelled() {
        return Err(NetworkError::new(Cancelled));
    }
    tokio::select! {
        biased;
        _ = opts.cancellation.cancelled() => Err(NetworkError::new(Cancelled)),
        res = tokio::time::timeout(opts.timeout, transport.round_trip(request)) => match res {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(NetworkError::new(e)),
            Err(_) => Err(NetworkError::new(TimedOut(opts.timeout))),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::is_network_error;
    use crate::retry::{Backoff, ConstantBackoff, StopBackoff, WithMaxRetries};
    use crate::test_util::{reply, FnTransport, HangingTransport, Reply};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    const URL: &str = "http://registry.example.com/v2/";

    fn statuses(
        codes: &'static [u16],
    ) -> Arc<FnTransport<impl Fn(&reqwest::Request) -> Reply + Send + Sync>> {
        let next = AtomicUsize::new(0);
        Arc::new(FnTransport::new(move |_| {
            let i = next.fetch_add(1, Ordering::SeqCst).min(codes.len() - 1);
            reply(codes[i], "")
        }))
    }

    /// Hands out a constant delay and remembers every one it produced.
    struct RecordingBackoff {
        inner: WithMaxRetries<ConstantBackoff>,
        handed_out: Arc<Mutex<Vec<Duration>>>,
    }

    impl Backoff for RecordingBackoff {
        fn next_backoff(&mut self) -> Option<Duration> {
            let delay = self.inner.next_backoff();
            if let Some(d) = delay {
                self.handed_out.lock().unwrap().push(d);
            }
            delay
        }

        fn reset(&mut self) {
            self.inner.reset()
        }
    }

    #[rstest]
    #[case(&[200], 200, true)]
    #[case(&[200, 401], 401, true)]
    #[case(&[200], 404, false)]
    #[case(&[201, 202], 200, false)]
    #[case(&[500], 500, true)]
    #[tokio::test]
    async fn accepted_codes_decide_success(
        #[case] accepted: &[u16],
        #[case] status: u16,
        #[case] success: bool,
    ) {
        let transport = Arc::new(FnTransport::new(move |_| reply(status, "body")));
        let res = send(
            Method::GET,
            URL,
            SendOptions::new()
                .transport(transport)
                .accepted_codes(accepted.iter().map(|c| StatusCode::from_u16(*c).unwrap())),
        )
        .await;
        match res {
            Ok(response) => {
                assert!(success);
                assert_eq!(response.status().as_u16(), status);
            }
            Err(e) => {
                assert!(!success);
                let status_error = e.status_error().expect("status error");
                assert_eq!(status_error.status.as_u16(), status);
                assert_eq!(status_error.response_dump, "body");
                assert_eq!(status_error.method, Method::GET);
                assert_eq!(status_error.url, URL);
            }
        }
    }

    #[tokio::test]
    async fn no_retry_unless_requested() {
        let transport = statuses(&[503, 200]);
        let err = get(URL, SendOptions::new().transport(transport.clone()))
            .await
            .expect_err("503 is not accepted");
        assert!(err.is_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(err.is_retryable());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let transport = statuses(&[503, 503, 503, 200]);
        let handed_out = Arc::new(Mutex::new(Vec::new()));
        let backoff = RecordingBackoff {
            inner: WithMaxRetries::new(ConstantBackoff(Duration::from_millis(10)), 3),
            handed_out: handed_out.clone(),
        };
        let started = Instant::now();
        let response = get(
            URL,
            SendOptions::new()
                .transport(transport.clone())
                .retry(RetryPolicy::default().with_backoff(backoff)),
        )
        .await
        .expect("fourth attempt succeeds");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.calls(), 4);
        let handed_out = handed_out.lock().unwrap().clone();
        assert_eq!(handed_out.len(), 3);
        assert!(handed_out.windows(2).all(|w| w[0] <= w[1]));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let transport = statuses(&[502]);
        let err = get(
            URL,
            SendOptions::new().transport(transport.clone()).retry(
                RetryPolicy::default().with_backoff(WithMaxRetries::new(
                    ConstantBackoff(Duration::from_millis(1)),
                    2,
                )),
            ),
        )
        .await
        .expect_err("every attempt fails");
        assert!(err.is_status(StatusCode::BAD_GATEWAY));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn stop_backoff_means_single_attempt() {
        let transport = statuses(&[503, 200]);
        let err = get(
            URL,
            SendOptions::new()
                .transport(transport.clone())
                .retry(RetryPolicy::default().with_backoff(StopBackoff)),
        )
        .await
        .expect_err("no second attempt");
        assert!(err.is_status(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn accepted_retryable_status_is_not_retried() {
        let transport = statuses(&[429, 200]);
        let response = get(
            URL,
            SendOptions::new()
                .transport(transport.clone())
                .accepted_codes([StatusCode::TOO_MANY_REQUESTS])
                .retry(RetryPolicy::default()),
        )
        .await
        .expect("429 is accepted");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn extra_codes_are_retried() {
        let transport = statuses(&[404, 200]);
        let policy = RetryPolicy::default()
            .with_backoff(ConstantBackoff(Duration::from_millis(1)))
            .with_codes([StatusCode::NOT_FOUND]);
        let response = get(URL, SendOptions::new().transport(transport.clone()).retry(policy))
            .await
            .expect("second attempt succeeds");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn network_errors_are_retried_and_surfaced() {
        let transport = Arc::new(FnTransport::new(|_| Err("connection refused".into())));
        let err = get(
            URL,
            SendOptions::new().transport(transport.clone()).retry(
                RetryPolicy::default().with_backoff(WithMaxRetries::new(
                    ConstantBackoff(Duration::from_millis(1)),
                    3,
                )),
            ),
        )
        .await
        .expect_err("host is down");
        assert!(err.is_network_error());
        assert!(is_network_error(&err));
        assert!(err.status_error().is_none());
        assert_eq!(err.to_string(), "network error: connection refused");
        assert_eq!(transport.calls(), 4);
    }

    fn https_down() -> Arc<FnTransport<impl Fn(&reqwest::Request) -> Reply + Send + Sync>> {
        Arc::new(FnTransport::new(|req| {
            if req.url().scheme() == "https" {
                Err("tls handshake failure".into())
            } else {
                reply(200, "")
            }
        }))
    }

    #[tokio::test]
    async fn https_failure_is_a_network_error_by_default() {
        let transport = https_down();
        let err = get(
            "https://registry.example.com/v2/",
            SendOptions::new().transport(transport.clone()),
        )
        .await
        .expect_err("no plain http attempt");
        assert!(err.is_network_error());
        assert_eq!(err.to_string(), "network error: tls handshake failure");
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.scheme(), "https");
    }

    #[tokio::test]
    async fn http_fallback_is_opt_in() {
        let transport = https_down();
        let response = get(
            "https://registry.example.com/v2/",
            SendOptions::new()
                .transport(transport.clone())
                .enable_http_fallback(),
        )
        .await
        .expect("http succeeds");
        assert_eq!(response.status(), StatusCode::OK);
        let schemes: Vec<_> = transport
            .requests()
            .iter()
            .map(|r| r.url.scheme().to_string())
            .collect();
        assert_eq!(schemes, vec!["https", "http"]);

        let err = get(
            "https://registry.example.com/v2/",
            SendOptions::new()
                .transport(transport.clone())
                .enable_http_fallback()
                .disable_http_fallback(),
        )
        .await
        .expect_err("fallback disabled again");
        assert!(err.is_network_error());
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn failed_fallback_reports_https_error() {
        let transport = Arc::new(FnTransport::new(|req| {
            if req.url().scheme() == "https" {
                Err("tls handshake failure".into())
            } else {
                Err("connection refused".into())
            }
        }));
        let err = get(
            "https://registry.example.com/v2/",
            SendOptions::new()
                .transport(transport.clone())
                .enable_http_fallback(),
        )
        .await
        .expect_err("both schemes fail");
        assert_eq!(err.to_string(), "network error: tls handshake failure");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn tls_transport_forces_https() {
        let transport = Arc::new(FnTransport::new(|_| reply(200, "")));
        get(URL, SendOptions::new().tls_transport(transport.clone()))
            .await
            .expect("request succeeds");
        assert_eq!(
            transport.requests()[0].url.as_str(),
            "https://registry.example.com/v2/"
        );
    }

    #[tokio::test]
    async fn builds_request_from_options() {
        let transport = Arc::new(FnTransport::new(|_| reply(201, "")));
        post(
            "http://registry.example.com/v2/foo/blobs/uploads/",
            SendOptions::new()
                .transport(transport.clone())
                .accepted_codes([StatusCode::CREATED])
                .header("X-Custom", "one")
                .header("Content-Type", "application/octet-stream")
                .body(&b"layer"[..]),
        )
        .await
        .expect("upload accepted");
        head(URL, SendOptions::new().transport(transport.clone()))
            .await
            .expect_err("201 is not accepted by default");

        let requests = transport.requests();
        assert_eq!(requests[0].method, Method::POST);
        assert_eq!(requests[0].headers["X-Custom"], "one");
        assert_eq!(requests[0].headers["Content-Type"], "application/octet-stream");
        assert_eq!(requests[0].body, b"layer".to_vec());
        assert_eq!(requests[1].method, Method::HEAD);
        assert_eq!(requests[1].headers[CONTENT_LENGTH], "0");
        assert!(requests[1].body.is_empty());
    }

    #[tokio::test]
    async fn identical_calls_are_independent() {
        let transport = Arc::new(FnTransport::new(|_| reply(200, "ok")));
        let first = get(URL, SendOptions::new().transport(transport.clone()))
            .await
            .expect("first");
        let second = get(URL, SendOptions::new().transport(transport.clone()))
            .await
            .expect("second");
        assert_eq!(first.text().await.unwrap(), "ok");
        assert_eq!(second.text().await.unwrap(), "ok");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn malformed_url_fails_fast() {
        let transport = Arc::new(FnTransport::new(|_| reply(200, "")));
        let err = get("not a url", SendOptions::new().transport(transport.clone()))
            .await
            .expect_err("malformed");
        assert!(matches!(err, RegistryError::InvalidUrl { .. }));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_header_is_rejected() {
        let transport = Arc::new(FnTransport::new(|_| reply(200, "")));
        let err = get(
            URL,
            SendOptions::new()
                .transport(transport)
                .header("bad header", "value"),
        )
        .await
        .expect_err("invalid header name");
        assert!(matches!(err, RegistryError::InvalidHeader(name) if name == "bad header"));
    }

    #[tokio::test]
    async fn attempt_times_out() {
        let err = get(
            "https://registry.example.com/v2/",
            SendOptions::new()
                .transport(Arc::new(HangingTransport))
                .timeout(Duration::from_millis(20))
                .disable_http_fallback(),
        )
        .await
        .expect_err("never answers");
        match err {
            RegistryError::Network(e) => assert!(e.is_timeout()),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_attempt() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = get(
            "https://registry.example.com/v2/",
            SendOptions::new()
                .transport(Arc::new(HangingTransport))
                .cancellation(token),
        )
        .await
        .expect_err("cancelled");
        match err {
            RegistryError::Network(e) => assert!(e.is_cancelled()),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_backoff_sleep() {
        let transport = statuses(&[503]);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let started = Instant::now();
        let err = get(
            URL,
            SendOptions::new()
                .transport(transport.clone())
                .cancellation(token)
                .retry(RetryPolicy::default().with_backoff(ConstantBackoff(Duration::from_secs(30)))),
        )
        .await
        .expect_err("cancelled while sleeping");
        assert!(err.is_network_error());
        assert_eq!(transport.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancelled_token_prevents_any_attempt() {
        let transport = Arc::new(FnTransport::new(|_| reply(200, "")));
        let token = CancellationToken::new();
        token.cancel();
        for _ in 0..50 {
            let err = get(
                URL,
                SendOptions::new()
                    .transport(transport.clone())
                    .cancellation(token.clone())
                    .retry(RetryPolicy::default()),
            )
            .await
            .expect_err("already cancelled");
            match err {
                RegistryError::Network(e) => assert!(e.is_cancelled()),
                other => panic!("unexpected error {:?}", other),
            }
        }
        assert_eq!(transport.calls(), 0);
    }

    /// Counts how many of its response bodies were released.
    struct StreamingTransport {
        statuses: Mutex<Vec<u16>>,
        released: Arc<AtomicUsize>,
    }

    struct ReleaseGuard(Arc<AtomicUsize>);

    impl Drop for ReleaseGuard {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Transport for StreamingTransport {
        fn round_trip(
            &self,
            _request: reqwest::Request,
        ) -> futures_util::future::BoxFuture<
            '_,
            std::result::Result<reqwest::Response, crate::errors::BoxError>,
        > {
            use futures_util::{FutureExt, StreamExt};

            let status = self.statuses.lock().unwrap().remove(0);
            let guard = ReleaseGuard(self.released.clone());
            let body = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(
                "unavailable",
            ))])
            .map(move |chunk| {
                let _guard = &guard;
                chunk
            });
            let response = http::Response::builder()
                .status(status)
                .body(reqwest::Body::wrap_stream(body))
                .unwrap();
            futures_util::future::ready(Ok(reqwest::Response::from(response))).boxed()
        }
    }

    #[tokio::test]
    async fn retried_responses_are_released() {
        let released = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(StreamingTransport {
            statuses: Mutex::new(vec![503, 503, 200]),
            released: released.clone(),
        });
        let response = get(
            URL,
            SendOptions::new().transport(transport).retry(
                RetryPolicy::default().with_backoff(ConstantBackoff(Duration::from_millis(1))),
            ),
        )
        .await
        .expect("third attempt succeeds");
        assert_eq!(released.load(Ordering::SeqCst), 2);
        drop(response);
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn redirect_policy_with_transport_keeps_transport() {
        let transport = Arc::new(FnTransport::new(|_| reply(200, "")));
        get(
            URL,
            SendOptions::new()
                .transport(transport.clone())
                .redirect(reqwest::redirect::Policy::none()),
        )
        .await
        .expect("supplied transport answers");
        assert_eq!(transport.calls(), 1);
    }
}

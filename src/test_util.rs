//! In-memory transports for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use http::{HeaderMap, Method};
use reqwest::Url;

use crate::errors::BoxError;
use crate::transport::Transport;

pub(crate) type Reply = Result<http::Response<String>, BoxError>;

/// What a [`FnTransport`] saw of a request
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Answers every request with the result of a closure and records it.
pub(crate) struct FnTransport<F> {
    handler: F,
    calls: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl<F> FnTransport<F>
where
    F: Fn(&reqwest::Request) -> Reply + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        FnTransport {
            handler,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl<F> Transport for FnTransport<F>
where
    F: Fn(&reqwest::Request) -> Reply + Send + Sync,
{
    fn round_trip(
        &self,
        request: reqwest::Request,
    ) -> BoxFuture<'_, Result<reqwest::Response, BoxError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(RecordedRequest {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            body: request
                .body()
                .and_then(|b| b.as_bytes())
                .map(|b| b.to_vec())
                .unwrap_or_default(),
        });
        let reply = (self.handler)(&request).map(reqwest::Response::from);
        future::ready(reply).boxed()
    }
}

/// Never answers.
pub(crate) struct HangingTransport;

impl Transport for HangingTransport {
    fn round_trip(
        &self,
        _request: reqwest::Request,
    ) -> BoxFuture<'_, Result<reqwest::Response, BoxError>> {
        future::pending().boxed()
    }
}

pub(crate) fn reply(status: u16, body: &str) -> Reply {
    reply_with_headers(status, &[], body)
}

pub(crate) fn reply_with_headers(status: u16, headers: &[(&str, &str)], body: &str) -> Reply {
    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    Ok(builder.body(body.to_string())?)
}

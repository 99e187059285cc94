//! The round-tripper seam that every request flows through

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::errors::{BoxError, Result};

/// Executes a single HTTP request and hands back whatever response the peer
/// produced, regardless of its status.
///
/// Errors are reserved for failures that happen before a response is
/// available: DNS, connection, TLS, or an authentication step of a decorating
/// transport.
pub trait Transport: Send + Sync {
    /// Sends `request` once
    fn round_trip(
        &self,
        request: reqwest::Request,
    ) -> BoxFuture<'_, std::result::Result<reqwest::Response, BoxError>>;
}

impl Transport for reqwest::Client {
    fn round_trip(
        &self,
        request: reqwest::Request,
    ) -> BoxFuture<'_, std::result::Result<reqwest::Response, BoxError>> {
        self.execute(request).map(|res| res.map_err(BoxError::from)).boxed()
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn round_trip(
        &self,
        request: reqwest::Request,
    ) -> BoxFuture<'_, std::result::Result<reqwest::Response, BoxError>> {
        (**self).round_trip(request)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn round_trip(
        &self,
        request: reqwest::Request,
    ) -> BoxFuture<'_, std::result::Result<reqwest::Response, BoxError>> {
        (**self).round_trip(request)
    }
}

/// The encoding of the certificate
#[derive(Debug, Clone)]
pub enum CertificateEncoding {
    #[allow(missing_docs)]
    Der,
    #[allow(missing_docs)]
    Pem,
}

/// A x509 certificate
#[derive(Debug, Clone)]
pub struct Certificate {
    /// Which encoding is used by the certificate
    pub encoding: CertificateEncoding,

    /// Actual certificate
    pub data: Vec<u8>,
}

/// TLS settings used to build a transport for `https` requests
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Accept invalid certificates. Defaults to false
    pub accept_invalid_certificates: bool,

    /// A list of extra root certificates to trust. This can be used to connect
    /// to servers using self-signed certificates
    pub extra_root_certificates: Vec<Certificate>,
}

impl TlsConfig {
    /// Builds a transport honoring these settings
    pub fn build_transport(&self) -> Result<Arc<dyn Transport>> {
        let mut client_builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.accept_invalid_certificates);

        for c in &self.extra_root_certificates {
            let cert = match c.encoding {
                CertificateEncoding::Der => reqwest::Certificate::from_der(c.data.as_slice())?,
                CertificateEncoding::Pem => reqwest::Certificate::from_pem(c.data.as_slice())?,
            };
            client_builder = client_builder.add_root_certificate(cert);
        }

        Ok(Arc::new(client_builder.build()?))
    }
}

//! Resilient HTTP sending and authenticated transports for container registries
//!
//! [`sender::send`] issues one HTTP request, classifies its outcome and
//! optionally retries it. [`auth::build_transport`] probes a registry and
//! returns a [`transport::Transport`] attaching HTTP Basic credentials or a
//! bearer token to every request.
//!
//! ```no_run
//! use std::sync::Arc;
//! use registry_transport::secrets::Credentials;
//! use registry_transport::sender::{self, SendOptions};
//!
//! # async fn run() -> registry_transport::errors::Result<()> {
//! let transport = registry_transport::build_transport(
//!     "ghcr.io",
//!     "oras-project/oras",
//!     Arc::new(reqwest::Client::new()),
//!     Credentials::anonymous(),
//! )
//! .await?;
//! let tags = sender::get(
//!     "https://ghcr.io/v2/oras-project/oras/tags/list",
//!     SendOptions::new().transport(Arc::new(transport)),
//! )
//! .await?;
//! # drop(tags);
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

pub mod auth;
pub mod challenge;
pub mod errors;
pub mod ping;
pub mod retry;
pub mod secrets;
pub mod sender;
mod token_cache;
pub mod transport;

#[cfg(test)]
mod test_util;

#[doc(inline)]
pub use auth::{build_transport, AuthScheme, AuthTransport};
#[doc(inline)]
pub use errors::{RegistryError, StatusError};
#[doc(inline)]
pub use sender::{send, SendOptions};
#[doc(inline)]
pub use token_cache::{RegistryOperation, RepositoryScope};
#[doc(inline)]
pub use transport::Transport;

#[macro_use]
extern crate lazy_static;

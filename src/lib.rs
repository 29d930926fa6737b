//! Hyperleash
//!
//! Keeping outbound HTTP exchanges on a short leash: a total-request deadline enforced
//! independently of the underlying transport, policy-driven retries of transient failures,
//! and per-request lifecycle stats delivered through a callback.
//!
//! The entry point is [`Transport`], started from a [`TransportConfig`]:
//!
//! ```no_run
//! # use std::time::Duration;
//! # use hyperleash::TransportConfig;
//! # async fn run() -> Result<(), hyperleash::BoxError> {
//! let transport = TransportConfig::default()
//!     .with_request_timeout(Duration::from_secs(60))
//!     .with_max_tries(3)
//!     .start()?;
//!
//! let response = transport.get("http://example.com/".parse()?).await?;
//! let body = http_body_util::BodyExt::collect(response.into_body()).await?;
//! println!("{:?}", body.to_bytes());
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::future::Future;
use std::pin::Pin;

pub mod body;
pub use body::Body;
pub mod client;
pub use client::{Error, RequestRef, Transport, TransportConfig};
mod notify;
pub mod service;

/// A boxed error type which is `Send` and `Sync`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A boxed future which is `Send`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

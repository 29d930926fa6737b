//! The underlying transport: the component which actually performs I/O.
//!
//! [`Transport`](crate::Transport) never touches sockets itself. It delegates every attempt
//! to an implementation of [`Exchange`], and asks the same implementation to cancel an
//! attempt when its deadline elapses. [`HttpTransport`] is the default, built on Hyper's
//! pooled client; a [`MockTransport`] is available behind the `mocks` feature.

use std::fmt;

use super::{Error, RequestRef};
use crate::body::{Request, Response};
use crate::BoxFuture;

mod http;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;
#[cfg(feature = "tls")]
mod tls;

pub use self::http::HttpTransport;
#[cfg(any(test, feature = "mocks"))]
pub use self::mock::{MockOutcome, MockTransport};
#[cfg(feature = "tls")]
pub use self::tls::default_tls_config;

/// A raw, point-to-point HTTP transport.
///
/// Implementations should observe cancellation of the request's [`RequestRef`] (found in its
/// extensions) and fail the attempt promptly with [`Error::Canceled`] when it fires;
/// [`RequestRef::cancelable`] does this for any future. Cancellation is best-effort: an
/// attempt which completes before observing it may still succeed.
///
/// A response status is never an error; only failures to complete the exchange are.
pub trait Exchange: fmt::Debug + Send + Sync + 'static {
    /// Perform a single request/response exchange.
    ///
    /// The returned future resolves once the response headers have arrived.
    fn exchange(&self, request: Request) -> BoxFuture<'static, Result<Response, Error>>;

    /// Cancel the in-flight attempt(s) belonging to `request`.
    ///
    /// This is fire-and-forget: the attempt reports its own error once it notices.
    fn cancel(&self, request: &RequestRef) {
        request.cancel();
    }

    /// Close any pooled connections which are not currently in use.
    fn close_idle_connections(&self) {}
}

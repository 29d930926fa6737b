//! The request-lifecycle controlled HTTP transport.
//!
//! A [`Transport`] wraps an underlying [`Exchange`] implementation and adds:
//!
//! - a total deadline per logical exchange, covering every retry and the backoff between
//!   them, enforced by a background monitor which cancels expired exchanges,
//! - retries of transient failures according to a [`RetryPolicy`](retry::RetryPolicy),
//! - lifecycle stats for every exchange, delivered to a [`StatsSink`](stats::StatsSink).
//!
//! A logical exchange starts when [`Transport::exchange`] is called and ends when it fails
//! or, if it succeeds, when the response body is dropped. Callers must drop (or fully
//! consume) every response body they receive, or the exchange is only ended by its deadline.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Uri;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, Instrument as _};

use self::deadline::DeadlineQueue;
use self::lifecycle::Lifecycle;
use self::monitor::Monitor;
use self::retry::{Attempted, Failed, Retry};
use crate::body::{Body, Request, Response};
use crate::BoxFuture;

mod config;
pub mod deadline;
mod error;
mod lifecycle;
mod monitor;
mod request;
pub mod retry;
pub mod stats;
pub mod transport;

pub use self::config::{PoolConfig, Proxy, TransportConfig};
pub use self::error::Error;
pub use self::monitor::DEFAULT_TICK;
pub use self::request::RequestRef;
pub use self::transport::Exchange;

/// An HTTP transport with total-request deadlines, retries and lifecycle stats.
///
/// Cloning is cheap, and all clones share the same deadline queue, monitor and underlying
/// transport.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

struct Shared {
    config: TransportConfig,
    queue: Arc<DeadlineQueue>,
    underlying: Arc<dyn Exchange>,
    monitor: Mutex<Option<Monitor>>,
    ids: AtomicU64,
    closed: AtomicBool,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.shared.config)
            .field("underlying", &self.shared.underlying)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport {
    /// Start a transport over the default [`HttpTransport`](transport::HttpTransport).
    ///
    /// Must be called from within a Tokio runtime, since it spawns the deadline monitor.
    pub fn start(config: TransportConfig) -> Result<Self, Error> {
        let underlying = transport::HttpTransport::new(&config)?;
        Ok(Self::start_with(config, underlying))
    }

    /// Start a transport over a custom underlying transport.
    ///
    /// Must be called from within a Tokio runtime, since it spawns the deadline monitor.
    pub fn start_with<E: Exchange>(config: TransportConfig, underlying: E) -> Self {
        let queue = Arc::new(DeadlineQueue::new());
        let underlying: Arc<dyn Exchange> = Arc::new(underlying);
        let monitor = Monitor::start(queue.clone(), underlying.clone(), config.tick);
        debug!(?config, "transport started");

        Self {
            shared: Arc::new(Shared {
                config,
                queue,
                underlying,
                monitor: Mutex::new(Some(monitor)),
                ids: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The configuration this transport was started with.
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Number of logical exchanges currently holding a deadline.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Has [`close`](Transport::close) been called?
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Assign `request` its exchange identity ahead of time, so it can be
    /// [canceled](Transport::cancel) while in flight.
    ///
    /// A request which already carries a [`RequestRef`] keeps it.
    pub fn identify(&self, request: &mut Request) -> RequestRef {
        if let Some(reference) = RequestRef::from_extensions(request.extensions()) {
            return reference.clone();
        }

        let id = self.shared.ids.fetch_add(1, Ordering::Relaxed);
        let reference = RequestRef::new(id, request.method().clone(), request.uri().clone());
        request.extensions_mut().insert(reference.clone());
        reference
    }

    /// Perform a logical exchange: the first attempt, plus any retries the policy allows,
    /// all within the total request timeout.
    ///
    /// The response's extensions carry the exchange's [`RequestRef`]. The exchange is
    /// finalized (its deadline released and its terminal stats emitted) when the response
    /// body is dropped.
    pub async fn exchange(&self, mut request: Request) -> Result<Response, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let reference = self.identify(&mut request);
        let span = tracing::debug_span!("exchange", request.id = reference.id());

        async move {
            let shared = &*self.shared;
            let start = Instant::now();
            let handle = shared
                .queue
                .insert(reference.clone(), start + shared.config.request_timeout);
            let lifecycle = Lifecycle::new(
                shared.queue.clone(),
                handle,
                reference.clone(),
                start,
                shared.config.stats.clone(),
            );

            debug!(method = %reference.method(), uri = %reference.uri(), "sending request");
            let retry = Retry {
                policy: &shared.config.retry,
                transport: shared.underlying.as_ref(),
                stats: shared.config.stats.as_deref(),
                reference: &reference,
                start,
                progress: lifecycle.retries(),
            };

            let outcome = retry.attempt(request).await;
            match outcome {
                Ok(Attempted { response, retries }) => {
                    debug!(status = %response.status(), retries, "received response");
                    Ok(lifecycle.succeed(response, retries))
                }
                Err(Failed { error, retries }) => {
                    debug!(%error, retries, "request failed");
                    lifecycle.fail(&error, retries);
                    Err(error)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Send a `GET` request for `uri`.
    pub async fn get(&self, uri: Uri) -> Result<Response, Error> {
        let mut request = Request::new(Body::empty());
        *request.uri_mut() = uri;
        self.exchange(request).await
    }

    /// Cancel an in-flight exchange through the underlying transport.
    ///
    /// Returns immediately; the exchange fails with [`Error::Canceled`] once the
    /// cancellation is observed. Canceling a finished exchange has no effect.
    pub fn cancel(&self, request: &RequestRef) {
        debug!(request.id = request.id(), "canceling request");
        self.shared.underlying.cancel(request);
    }

    /// Close idle connections and stop the deadline monitor, waiting for it to finish.
    ///
    /// Further exchanges fail with [`Error::Closed`]. Exchanges already in flight carry on,
    /// but their deadlines are no longer enforced. Closing again does nothing.
    pub async fn close(&self) -> Result<(), Error> {
        let Some(monitor) = self.shared.monitor.lock().take() else {
            return Ok(());
        };

        self.shared.closed.store(true, Ordering::Release);
        self.shared.underlying.close_idle_connections();
        monitor.close().await?;
        debug!(pending = self.pending(), "transport closed");
        Ok(())
    }
}

impl tower::Service<Request> for Transport {
    type Response = Response;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Response, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.is_closed() {
            return Poll::Ready(Err(Error::Closed));
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let transport = self.clone();
        Box::pin(async move { transport.exchange(request).await })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::StatusCode;
    use http_body_util::BodyExt as _;
    use static_assertions::assert_impl_all;
    use tower::ServiceExt as _;

    use super::transport::mock::{MockOutcome, MockTransport};
    use super::*;

    assert_impl_all!(Transport: Send, Sync, Clone);
    assert_impl_all!(Error: Send, Sync, std::error::Error);

    fn uri() -> Uri {
        Uri::from_static("http://mock.test/")
    }

    #[tokio::test]
    async fn exchange_tags_response_with_identity() {
        let transport = TransportConfig::default().start_with(MockTransport::new());

        let response = transport.get(uri()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reference = RequestRef::from_extensions(response.extensions()).cloned().unwrap();
        assert_eq!(reference.uri(), &uri());
        assert_eq!(transport.pending(), 1);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "42");
        assert_eq!(transport.pending(), 0);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let transport = TransportConfig::default().start_with(MockTransport::new());

        let first = transport.get(uri()).await.unwrap();
        let second = transport.get(uri()).await.unwrap();
        let id = |response: &Response| {
            RequestRef::from_extensions(response.extensions())
                .unwrap()
                .id()
        };
        assert_ne!(id(&first), id(&second));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn external_cancel() {
        let mock = MockTransport::hanging();
        let transport = TransportConfig::default().start_with(mock.clone());

        let mut request = Request::new(Body::empty());
        *request.uri_mut() = uri();
        let reference = transport.identify(&mut request);

        let pending = tokio::spawn({
            let transport = transport.clone();
            async move { transport.exchange(request).await }
        });

        while transport.pending() == 0 {
            tokio::task::yield_now().await;
        }
        transport.cancel(&reference);

        let error = pending.await.unwrap().unwrap_err();
        assert!(error.is_canceled());
        assert_eq!(mock.canceled(), vec![reference.id()]);
        assert_eq!(transport.pending(), 0);

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let mock = MockTransport::new();
        let transport = TransportConfig::default().start_with(mock.clone());

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed());
        assert_eq!(mock.idle_closed(), 1);

        let error = transport.get(uri()).await.unwrap_err();
        assert!(matches!(error, Error::Closed));
        assert_eq!(mock.attempts(), 0);
    }

    #[tokio::test]
    async fn tower_service() {
        let transport = TransportConfig::default()
            .with_request_timeout(Duration::from_secs(5))
            .start_with(MockTransport::scripted(|_, _| {
                MockOutcome::Respond(StatusCode::SERVICE_UNAVAILABLE, "busy")
            }));

        let mut request = Request::new(Body::empty());
        *request.uri_mut() = uri();
        let response = transport.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        drop(response);

        transport.close().await.unwrap();
        let mut request = Request::new(Body::empty());
        *request.uri_mut() = uri();
        assert!(transport.clone().oneshot(request).await.is_err());
    }
}

//! Finalizing a logical exchange exactly once.
//!
//! A [`Lifecycle`] is created when an exchange registers its deadline. It ends in exactly
//! one of three ways, each of which removes the deadline entry and then emits the single
//! terminal stats record:
//!
//! - the exchange succeeds, and the response body is wrapped so the work happens when the
//!   body is dropped (closed),
//! - the exchange fails, and the work happens inline,
//! - the caller abandons the exchange future, and the work happens as it is dropped.
//!
//! The response body keeps racing the exchange's cancellation until it is closed. Once the
//! exchange is canceled, reads from the body fail with [`Error::Canceled`].

use std::future::Future as _;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body::Body as _;
use tokio::time::Instant;
use tracing::trace;

use super::deadline::{DeadlineQueue, EntryHandle};
use super::stats::{ResponseInfo, StatsRecord, StatsSink};
use super::{Error, RequestRef};
use crate::body::{Body, Response};
use crate::{BoxError, BoxFuture};

#[derive(Debug)]
struct Registration {
    queue: Arc<DeadlineQueue>,
    handle: EntryHandle,
    reference: RequestRef,
    start: Instant,
}

impl Registration {
    fn finish(
        self,
        stats: Option<&dyn StatsSink>,
        response: Option<&ResponseInfo>,
        error: Option<&Error>,
        header: Duration,
        body: Duration,
        retries: u32,
    ) {
        // The entry must be gone before the sink runs.
        self.queue.remove(self.handle);

        if let Some(stats) = stats {
            stats.record(&StatsRecord {
                request: &self.reference,
                response,
                error,
                header,
                body,
                retries,
                retry_pending: false,
            });
        }
    }
}

/// Owns the deadline entry of one in-flight logical exchange.
pub(crate) struct Lifecycle {
    registration: Option<Registration>,
    stats: Option<Arc<dyn StatsSink>>,
    retries: AtomicU32,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("registration", &self.registration)
            .field("stats", &self.stats.is_some())
            .field("retries", &self.retries)
            .finish()
    }
}

impl Lifecycle {
    pub(crate) fn new(
        queue: Arc<DeadlineQueue>,
        handle: EntryHandle,
        reference: RequestRef,
        start: Instant,
        stats: Option<Arc<dyn StatsSink>>,
    ) -> Self {
        Self {
            registration: Some(Registration {
                queue,
                handle,
                reference,
                start,
            }),
            stats,
            retries: AtomicU32::new(0),
        }
    }

    /// Retries announced so far, reported if the exchange is abandoned.
    pub(crate) fn retries(&self) -> &AtomicU32 {
        &self.retries
    }

    /// Finalize a failed exchange immediately.
    pub(crate) fn fail(mut self, error: &Error, retries: u32) {
        if let Some(registration) = self.registration.take() {
            let header = registration.start.elapsed();
            registration.finish(
                self.stats.as_deref(),
                None,
                Some(error),
                header,
                Duration::ZERO,
                retries,
            );
        }
    }

    /// Hand the response back to the caller, deferring finalization until its body is closed.
    pub(crate) fn succeed(mut self, response: Response, retries: u32) -> Response {
        let Some(registration) = self.registration.take() else {
            return response;
        };

        let headers_at = Instant::now();
        let info = ResponseInfo::new(&response);
        let (mut parts, body) = response.into_parts();
        parts.extensions.insert(registration.reference.clone());

        let body = InstrumentedBody {
            inner: body,
            canceled: Some(registration.reference.canceled_owned()),
            finalizer: Some(Finalizer {
                registration,
                stats: self.stats.take(),
                response: info,
                headers_at,
                retries,
            }),
        };

        Response::from_parts(parts, Body::new(body))
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            trace!(
                request.id = registration.reference.id(),
                "exchange abandoned before completion"
            );
            let header = registration.start.elapsed();
            registration.finish(
                self.stats.as_deref(),
                None,
                Some(&Error::Canceled),
                header,
                Duration::ZERO,
                self.retries.load(Ordering::Acquire),
            );
        }
    }
}

struct Finalizer {
    registration: Registration,
    stats: Option<Arc<dyn StatsSink>>,
    response: ResponseInfo,
    headers_at: Instant,
    retries: u32,
}

impl Finalizer {
    fn finish(self, severed: bool) {
        let closed = Instant::now();
        let header = self.headers_at.duration_since(self.registration.start);
        let body = closed
            .duration_since(self.registration.start)
            .saturating_sub(header);

        trace!(
            request.id = self.registration.reference.id(),
            ?header,
            ?body,
            severed,
            "response body closed"
        );

        self.registration.finish(
            self.stats.as_deref(),
            Some(&self.response),
            severed.then_some(&Error::Canceled),
            header,
            body,
            self.retries,
        );
    }
}

/// A response body which finalizes its exchange when dropped.
///
/// Reads race the exchange's cancellation. `canceled` is cleared once that happens, and
/// the inner body is dropped.
#[pin_project::pin_project(PinnedDrop)]
struct InstrumentedBody {
    inner: Body,
    canceled: Option<BoxFuture<'static, ()>>,
    finalizer: Option<Finalizer>,
}

#[pin_project::pinned_drop]
impl PinnedDrop for InstrumentedBody {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(finalizer) = this.finalizer.take() {
            finalizer.finish(this.canceled.is_none());
        }
    }
}

impl http_body::Body for InstrumentedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let Some(canceled) = this.canceled.as_mut() else {
            return Poll::Ready(None);
        };
        if this.inner.is_end_stream() {
            return Pin::new(this.inner).poll_frame(cx);
        }

        if canceled.as_mut().poll(cx).is_ready() {
            *this.canceled = None;
            *this.inner = Body::empty();
            return Poll::Ready(Some(Err(Error::Canceled.into())));
        }

        Pin::new(this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.canceled.is_none() || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use http::{Method, Uri};
    use http_body_util::BodyExt as _;
    use parking_lot::Mutex;

    use super::*;

    type Seen = Arc<Mutex<Vec<(bool, bool, u32)>>>;

    fn sink() -> (Seen, Arc<dyn StatsSink>) {
        let seen: Seen = Default::default();
        let recorder = seen.clone();
        let sink: Arc<dyn StatsSink> = Arc::new(move |stats: &StatsRecord<'_>| {
            recorder
                .lock()
                .push((stats.error.is_some(), stats.response.is_some(), stats.retries));
        });
        (seen, sink)
    }

    fn register(queue: &Arc<DeadlineQueue>, stats: Arc<dyn StatsSink>) -> Lifecycle {
        let reference = RequestRef::new(1, Method::GET, Uri::from_static("http://example.com/"));
        let start = Instant::now();
        let handle = queue.insert(reference.clone(), start + Duration::from_secs(30));
        Lifecycle::new(queue.clone(), handle, reference, start, Some(stats))
    }

    #[tokio::test]
    async fn body_close_finalizes_once() {
        let queue = Arc::new(DeadlineQueue::new());
        let (seen, stats) = sink();
        let lifecycle = register(&queue, stats);

        let response = lifecycle.succeed(http::Response::new(Body::from("42")), 2);
        assert_eq!(queue.len(), 1);
        assert!(RequestRef::from_extensions(response.extensions()).is_some());
        assert!(seen.lock().is_empty());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "42");

        assert!(queue.is_empty());
        assert_eq!(&*seen.lock(), &[(false, true, 2)]);
    }

    #[test]
    fn failure_finalizes_inline() {
        let queue = Arc::new(DeadlineQueue::new());
        let (seen, stats) = sink();
        let lifecycle = register(&queue, stats);

        lifecycle.fail(&Error::transport("boom"), 1);
        assert!(queue.is_empty());
        assert_eq!(&*seen.lock(), &[(true, false, 1)]);
    }

    #[test]
    fn abandonment_finalizes_on_drop() {
        let queue = Arc::new(DeadlineQueue::new());
        let (seen, stats) = sink();
        drop(register(&queue, stats));

        assert!(queue.is_empty());
        assert_eq!(&*seen.lock(), &[(true, false, 0)]);
    }

    #[test]
    fn abandonment_reports_retries_so_far() {
        let queue = Arc::new(DeadlineQueue::new());
        let (seen, stats) = sink();
        let lifecycle = register(&queue, stats);
        lifecycle.retries().store(2, Ordering::Release);
        drop(lifecycle);

        assert_eq!(&*seen.lock(), &[(true, false, 2)]);
    }

    #[tokio::test]
    async fn cancellation_severs_an_open_body() {
        let queue = Arc::new(DeadlineQueue::new());
        let (seen, stats) = sink();
        let lifecycle = register(&queue, stats);

        let stalled = Body::new(Stall);
        let response = lifecycle.succeed(http::Response::new(stalled), 0);
        let reference = RequestRef::from_extensions(response.extensions()).cloned().unwrap();
        let mut body = response.into_body();

        let canceler = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            reference.cancel();
        });

        let frame = tokio::time::timeout(Duration::from_secs(1), body.frame())
            .await
            .expect("cancellation should end the read");
        let error = frame.unwrap().unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Canceled)));
        assert!(body.is_end_stream());
        assert!(body.frame().await.is_none());
        canceler.await.unwrap();

        drop(body);
        assert!(queue.is_empty());
        assert_eq!(&*seen.lock(), &[(true, true, 0)]);
    }

    /// A body which never yields a frame.
    struct Stall;

    impl http_body::Body for Stall {
        type Data = Bytes;
        type Error = std::convert::Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<http_body::Frame<Bytes>, Self::Error>>> {
            Poll::Pending
        }
    }
}

//! Bounding the wait for a service's response.
//!
//! Unlike `tower::timeout`, the error produced on expiry is of the service's own concrete
//! error type, so callers keep matching on it instead of downcasting a `BoxError`.

use std::fmt;
use std::task::{Context, Poll};
use std::time::Duration;

/// Applies a [`Timeout`] to a service.
pub struct TimeoutLayer<E> {
    elapsed: fn() -> E,
    duration: Duration,
}

impl<E> TimeoutLayer<E> {
    /// Fail calls with `elapsed()` when they take longer than `duration`.
    pub fn new(elapsed: fn() -> E, duration: Duration) -> Self {
        Self { elapsed, duration }
    }
}

impl<E> Clone for TimeoutLayer<E> {
    fn clone(&self) -> Self {
        Self {
            elapsed: self.elapsed,
            duration: self.duration,
        }
    }
}

impl<E> fmt::Debug for TimeoutLayer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutLayer")
            .field("duration", &self.duration)
            .finish()
    }
}

impl<S, E> tower::Layer<S> for TimeoutLayer<E> {
    type Service = Timeout<S, E>;

    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            elapsed: self.elapsed,
            duration: self.duration,
        }
    }
}

/// A service whose calls fail once `duration` passes without a response.
///
/// The clock starts when the call is made, not when the returned future is first polled.
pub struct Timeout<S, E> {
    inner: S,
    elapsed: fn() -> E,
    duration: Duration,
}

impl<S: Clone, E> Clone for Timeout<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            elapsed: self.elapsed,
            duration: self.duration,
        }
    }
}

impl<S: fmt::Debug, E> fmt::Debug for Timeout<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("inner", &self.inner)
            .field("duration", &self.duration)
            .finish()
    }
}

impl<S, E, Req> tower::Service<Req> for Timeout<S, E>
where
    S: tower::Service<Req, Error = E>,
{
    type Response = S::Response;
    type Error = E;
    type Future = future::TimeoutFuture<S::Future, E>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        future::TimeoutFuture {
            inner: self.inner.call(req),
            elapsed: self.elapsed,
            sleep: tokio::time::sleep(self.duration),
        }
    }
}

mod future {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    #[derive(Debug)]
    #[pin_project::pin_project]
    pub struct TimeoutFuture<F, E> {
        #[pin]
        pub(super) inner: F,
        pub(super) elapsed: fn() -> E,
        #[pin]
        pub(super) sleep: tokio::time::Sleep,
    }

    impl<F, R, E> Future for TimeoutFuture<F, E>
    where
        F: Future<Output = Result<R, E>>,
    {
        type Output = Result<R, E>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            let this = self.project();

            // A response which is ready wins over a timer which is also ready.
            if let Poll::Ready(outcome) = this.inner.poll(cx) {
                return Poll::Ready(outcome);
            }

            match this.sleep.poll(cx) {
                Poll::Ready(()) => Poll::Ready(Err((this.elapsed)())),
                Poll::Pending => Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tower::{service_fn, Layer as _, ServiceExt as _};

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Failure {
        Slow,
    }

    #[tokio::test]
    async fn slow_call_fails_with_custom_error() {
        let slow = service_fn(|_: ()| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, Failure>("done")
        });
        let service = TimeoutLayer::new(|| Failure::Slow, Duration::from_millis(10)).layer(slow);

        assert_eq!(service.oneshot(()).await, Err(Failure::Slow));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let fast = service_fn(|n: u32| async move { Ok::<_, Failure>(n + 1) });
        let service = TimeoutLayer::new(|| Failure::Slow, Duration::from_secs(5)).layer(fast);

        assert_eq!(service.oneshot(41).await.unwrap(), 42);
    }
}

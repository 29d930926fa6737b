//! Middleware which may or may not be present, decided at runtime.
//!
//! `tower::util::Either` would serve, but boxes its errors. [`OptionService`] instead
//! keeps the inner service's error type, converting the middleware's errors into it.

use std::task::{Context, Poll};

use tower::layer::util::Stack;
use tower::ServiceBuilder;

/// Adds [`optional`](OptionLayerExt::optional) to [`ServiceBuilder`].
pub trait OptionLayerExt<L> {
    /// Wrap the service in `middleware` only when it is `Some`.
    fn optional<M>(self, middleware: Option<M>) -> ServiceBuilder<Stack<OptionLayer<M>, L>>;
}

impl<L> OptionLayerExt<L> for ServiceBuilder<L> {
    fn optional<M>(self, middleware: Option<M>) -> ServiceBuilder<Stack<OptionLayer<M>, L>> {
        self.layer(OptionLayer { middleware })
    }
}

/// Applies a middleware layer if one is configured.
#[derive(Debug, Clone)]
pub struct OptionLayer<M> {
    middleware: Option<M>,
}

impl<M> OptionLayer<M> {
    /// Apply `middleware`, if any.
    pub fn new(middleware: Option<M>) -> Self {
        Self { middleware }
    }
}

impl<M, S> tower::Layer<S> for OptionLayer<M>
where
    M: tower::Layer<S>,
{
    type Service = OptionService<M::Service, S>;

    fn layer(&self, inner: S) -> Self::Service {
        match &self.middleware {
            Some(middleware) => OptionService::Wrapped(middleware.layer(inner)),
            None => OptionService::Bare(inner),
        }
    }
}

/// A service which is either wrapped in a middleware (`M`) or used as is (`S`).
#[derive(Debug, Clone)]
pub enum OptionService<M, S> {
    /// The middleware was configured.
    Wrapped(M),

    /// No middleware.
    Bare(S),
}

impl<M, S, Req> tower::Service<Req> for OptionService<M, S>
where
    S: tower::Service<Req>,
    M: tower::Service<Req, Response = S::Response>,
    M::Error: Into<S::Error>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = future::OptionFuture<M::Future, S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self {
            OptionService::Wrapped(service) => service.poll_ready(cx).map_err(Into::into),
            OptionService::Bare(service) => service.poll_ready(cx),
        }
    }

    fn call(&mut self, req: Req) -> Self::Future {
        match self {
            OptionService::Wrapped(service) => future::OptionFuture::Wrapped(service.call(req)),
            OptionService::Bare(service) => future::OptionFuture::Bare(service.call(req)),
        }
    }
}

mod future {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    #[derive(Debug)]
    #[pin_project::pin_project(project = OptionFutureProj)]
    pub enum OptionFuture<M, S> {
        Wrapped(#[pin] M),
        Bare(#[pin] S),
    }

    impl<M, S, R, ME, E> Future for OptionFuture<M, S>
    where
        M: Future<Output = Result<R, ME>>,
        S: Future<Output = Result<R, E>>,
        ME: Into<E>,
    {
        type Output = Result<R, E>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            match self.project() {
                OptionFutureProj::Wrapped(future) => future.poll(cx).map_err(Into::into),
                OptionFutureProj::Bare(future) => future.poll(cx),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tower::{service_fn, ServiceExt as _};

    use super::*;
    use crate::service::TimeoutLayer;

    #[derive(Debug, PartialEq)]
    struct Late;

    fn slow() -> impl tower::Service<(), Response = &'static str, Error = Late> + Clone {
        service_fn(|_: ()| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, Late>("done")
        })
    }

    #[tokio::test]
    async fn absent_middleware_is_skipped() {
        let service = ServiceBuilder::new()
            .optional(None::<TimeoutLayer<Late>>)
            .service(slow());
        assert!(matches!(service, OptionService::Bare(_)));
        assert_eq!(service.oneshot(()).await, Ok("done"));
    }

    #[tokio::test]
    async fn present_middleware_applies() {
        let service = ServiceBuilder::new()
            .optional(Some(TimeoutLayer::new(|| Late, Duration::from_millis(1))))
            .service(slow());
        assert_eq!(service.oneshot(()).await, Err(Late));
    }
}

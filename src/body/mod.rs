//! A [Body](http_body::Body) type shared by requests and responses, able to wrap
//! the different bodies an exchange produces.
//!
//! Responses handed back by [`Transport`](crate::Transport) always carry a wrapped
//! body: dropping it is what "closing" a response means, and finalizes the exchange.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::Body as _;
use http_body::{Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;

use crate::BoxError;

/// An http request using [Body] as the body.
pub type Request = http::Request<Body>;

/// An http response using [Body] as the body.
pub type Response = http::Response<Body>;

/// The body of a request or response.
///
/// Bodies built from in-memory data ([`Bytes`], [`String`] or `&'static str`) are
/// buffered and can be cloned, so requests carrying them can be replayed. Anything
/// wrapped with [`Body::new`] streams and is sent at most once.
#[pin_project::pin_project]
pub struct Body {
    #[pin]
    kind: Kind,
}

#[pin_project::pin_project(project = KindProj)]
enum Kind {
    /// In-memory data, taken on the first poll. `None` once drained or when empty.
    Buffered(Option<Bytes>),
    Incoming(#[pin] hyper::body::Incoming),
    Streaming(#[pin] UnsyncBoxBody<Bytes, BoxError>),
}

impl Body {
    /// Wrap another [`http_body::Body`]. The result is never cloneable.
    pub fn new<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            kind: Kind::Streaming(UnsyncBoxBody::new(body.map_err(Into::into))),
        }
    }

    /// A body with no data.
    pub fn empty() -> Self {
        Self::buffered(Bytes::new())
    }

    fn buffered(data: Bytes) -> Self {
        let data = (!data.is_empty()).then_some(data);
        Self {
            kind: Kind::Buffered(data),
        }
    }

    /// Clone the body if its data is held in memory.
    pub fn try_clone(&self) -> Option<Self> {
        match &self.kind {
            Kind::Buffered(data) => Some(Self {
                kind: Kind::Buffered(data.clone()),
            }),
            Kind::Incoming(_) | Kind::Streaming(_) => None,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Self::buffered(data)
    }
}

impl From<String> for Body {
    fn from(data: String) -> Self {
        Self::buffered(data.into())
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Self::buffered(Bytes::from_static(data.as_bytes()))
    }
}

impl From<hyper::body::Incoming> for Body {
    fn from(body: hyper::body::Incoming) -> Self {
        Self {
            kind: Kind::Incoming(body),
        }
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        match self.project().kind.project() {
            KindProj::Buffered(data) => Poll::Ready(data.take().map(|data| Ok(Frame::data(data)))),
            KindProj::Incoming(body) => match body.poll_frame(cx) {
                Poll::Ready(Some(Err(error))) => Poll::Ready(Some(Err(error.into()))),
                Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
            KindProj::Streaming(body) => body.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Buffered(data) => data.is_none(),
            Kind::Incoming(body) => body.is_end_stream(),
            Kind::Streaming(body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Buffered(data) => {
                SizeHint::with_exact(data.as_ref().map_or(0, |data| data.len() as u64))
            }
            Kind::Incoming(body) => body.size_hint(),
            Kind::Streaming(body) => body.size_hint(),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Buffered(data) => f
                .debug_tuple("Body::Buffered")
                .field(&data.as_ref().map_or(0, Bytes::len))
                .finish(),
            Kind::Incoming(_) => f.write_str("Body::Incoming"),
            Kind::Streaming(_) => f.write_str("Body::Streaming"),
        }
    }
}

/// Extension trait to help clone a request that contains a `Body`.
pub trait TryCloneRequest {
    /// Try to clone the request. If the body can't be cloned, `None` is returned.
    ///
    /// Extensions are carried over, so the clone keeps its identity for cancellation.
    fn try_clone_request(&self) -> Option<Self>
    where
        Self: Sized;
}

impl TryCloneRequest for http::Request<Body> {
    fn try_clone_request(&self) -> Option<Self> {
        let body = match self.body().try_clone() {
            Some(body) => body,
            None if self.body().size_hint().exact() == Some(0) => Body::empty(),
            None => return None,
        };

        let mut req = http::Request::new(body);
        *req.method_mut() = self.method().clone();
        *req.uri_mut() = self.uri().clone();
        *req.version_mut() = self.version();
        *req.headers_mut() = self.headers().clone();
        *req.extensions_mut() = self.extensions().clone();
        Some(req)
    }
}

#[cfg(test)]
mod tests {
    use http_body::Body as HttpBody;
    use http_body_util::Full;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Body: HttpBody, Send, Unpin);

    #[tokio::test]
    async fn buffered_body_yields_one_frame() {
        let mut body = Body::from("Hello, World!".to_string());
        assert_eq!(body.size_hint().exact(), Some(13));
        assert!(!body.is_end_stream());

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"Hello, World!"));
        assert!(body.is_end_stream());
        assert!(body.frame().await.is_none());
    }

    #[test]
    fn empty_string_is_an_empty_body() {
        let body = Body::from(String::new());
        assert_eq!(body.size_hint().exact(), Some(0));
        assert!(body.is_end_stream());
        assert!(Body::empty().is_end_stream());
    }

    #[tokio::test]
    async fn wrapped_body_streams_once() {
        let body = Body::new(Full::new(Bytes::from_static(b"42")));
        assert!(body.try_clone().is_none());

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"42"));
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Marker(u32);

    #[test]
    fn clone_request_keeps_parts() {
        let mut request = http::Request::post("http://example.com/path")
            .header("x-test", "yes")
            .body(Body::from("payload"))
            .unwrap();
        request.extensions_mut().insert(Marker(7));

        let clone = request.try_clone_request().expect("buffered body is cloneable");
        assert_eq!(clone.method(), http::Method::POST);
        assert_eq!(clone.uri(), request.uri());
        assert_eq!(clone.headers().get("x-test").unwrap(), "yes");
        assert_eq!(clone.extensions().get::<Marker>(), Some(&Marker(7)));
        assert_eq!(clone.body().size_hint().exact(), Some(7));
    }

    #[test]
    fn clone_request_refuses_wrapped_body() {
        let request = http::Request::get("http://example.com/")
            .body(Body::new(Full::new(Bytes::from_static(b"chunk"))))
            .unwrap();

        assert!(request.try_clone_request().is_none());
    }
}

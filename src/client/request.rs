//! Identity and cancellation for a logical exchange.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use http::{Method, Uri};
use tokio::sync::watch;

use super::Error;
use crate::BoxFuture;

/// A handle identifying one logical exchange.
///
/// The transport creates one per call to [`Transport::exchange`](super::Transport::exchange)
/// and stores it in the extensions of the request (and of the response, on success), so
/// every retried attempt carries the same identity. Cloning is cheap; all clones share one
/// cancellation flag.
///
/// Cancellation is sticky: once [`RequestRef::cancel`] is called, every current and future
/// wait on [`RequestRef::canceled`] completes immediately.
#[derive(Clone)]
pub struct RequestRef {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    method: Method,
    uri: Uri,
    canceled: watch::Sender<bool>,
}

impl RequestRef {
    pub(crate) fn new(id: u64, method: Method, uri: Uri) -> Self {
        let (canceled, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id,
                method,
                uri,
                canceled,
            }),
        }
    }

    /// Find the identity attached to a request or response.
    pub fn from_extensions(extensions: &http::Extensions) -> Option<&RequestRef> {
        extensions.get::<RequestRef>()
    }

    /// Numeric id, unique within one transport.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    /// The request URI.
    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    /// Trip the cancellation flag, waking anything racing against it.
    pub fn cancel(&self) {
        self.inner.canceled.send_replace(true);
    }

    /// Has this exchange been canceled?
    pub fn is_canceled(&self) -> bool {
        *self.inner.canceled.borrow()
    }

    /// Resolves once this exchange is canceled.
    pub async fn canceled(&self) {
        let mut rx = self.inner.canceled.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|canceled| *canceled).await;
    }

    /// Like [`RequestRef::canceled`], but owning a clone of the handle so it can be stored.
    pub(crate) fn canceled_owned(&self) -> BoxFuture<'static, ()> {
        let reference = self.clone();
        Box::pin(async move { reference.canceled().await })
    }

    /// Race `future` against cancellation of this exchange.
    ///
    /// Resolves to [`Error::Canceled`] if the exchange is (or already was) canceled before
    /// `future` completes; `future` is dropped in that case, which is what severs the
    /// in-flight I/O.
    pub async fn cancelable<F, T>(&self, future: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        if self.is_canceled() {
            return Err(Error::Canceled);
        }

        tokio::select! {
            biased;
            _ = self.canceled() => Err(Error::Canceled),
            result = future => result,
        }
    }
}

impl PartialEq for RequestRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RequestRef {}

impl fmt::Debug for RequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRef")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method)
            .field("uri", &self.inner.uri)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(RequestRef: Send, Sync, Clone);

    fn request() -> RequestRef {
        RequestRef::new(1, Method::GET, Uri::from_static("http://example.com/"))
    }

    #[tokio::test]
    async fn cancel_interrupts_pending_future() {
        let reference = request();
        let racing = reference.clone();
        let task = tokio::spawn(async move {
            racing
                .cancelable(std::future::pending::<Result<(), Error>>())
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        reference.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cancellation should be observed")
            .unwrap();
        assert!(matches!(result, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn cancellation_is_sticky() {
        let reference = request();
        reference.cancel();
        assert!(reference.is_canceled());

        let result = reference.cancelable(async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn completed_future_wins() {
        let reference = request();
        let result = reference.cancelable(async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
        assert!(!reference.is_canceled());
    }

    #[test]
    fn identity_is_shared_by_clones() {
        let reference = request();
        let clone = reference.clone();
        assert_eq!(reference, clone);
        assert_ne!(reference, request());

        clone.cancel();
        assert!(reference.is_canceled());
    }
}

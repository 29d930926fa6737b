//! A scripted transport, suitable for testing behavior of transport-dependent code.
//!
//! Each attempt asks the script what to do, based on the zero-based attempt number
//! (counted across all requests) and the request itself.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use parking_lot::Mutex;

use super::Exchange;
use crate::body::{Body, Request, Response};
use crate::client::{Error, RequestRef};
use crate::BoxFuture;

/// What a [`MockTransport`] does with one attempt.
#[derive(Debug)]
pub enum MockOutcome {
    /// Respond immediately with this status and body.
    Respond(StatusCode, &'static str),

    /// Fail with this error.
    Fail(Error),

    /// Never respond; only cancellation ends the attempt.
    Hang,

    /// Respond with this status after a delay, unless canceled first.
    Delay(Duration, StatusCode),
}

type Script = dyn Fn(u32, &Request) -> MockOutcome + Send + Sync;

/// A transport whose attempts follow a script.
#[derive(Clone)]
pub struct MockTransport {
    script: Arc<Script>,
    attempts: Arc<AtomicU32>,
    canceled: Arc<Mutex<Vec<u64>>>,
    idle_closed: Arc<AtomicUsize>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("attempts", &self.attempts())
            .field("canceled", &self.canceled())
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A transport which answers every attempt with `200 OK` and the body `42`.
    pub fn new() -> Self {
        Self::scripted(|_, _| MockOutcome::Respond(StatusCode::OK, "42"))
    }

    /// A transport driven by `script`.
    pub fn scripted<F>(script: F) -> Self
    where
        F: Fn(u32, &Request) -> MockOutcome + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            attempts: Default::default(),
            canceled: Default::default(),
            idle_closed: Default::default(),
        }
    }

    /// A transport which fails every attempt with a transport error carrying `message`.
    pub fn failing(message: &'static str) -> Self {
        Self::scripted(move |_, _| MockOutcome::Fail(Error::transport(message)))
    }

    /// A transport which never answers.
    pub fn hanging() -> Self {
        Self::scripted(|_, _| MockOutcome::Hang)
    }

    /// Number of attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Ids of the requests canceled through this transport, in order.
    pub fn canceled(&self) -> Vec<u64> {
        self.canceled.lock().clone()
    }

    /// Number of times idle connections were closed.
    pub fn idle_closed(&self) -> usize {
        self.idle_closed.load(Ordering::SeqCst)
    }
}

impl Exchange for MockTransport {
    fn exchange(&self, request: Request) -> BoxFuture<'static, Result<Response, Error>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = (self.script)(attempt, &request);
        let reference = RequestRef::from_extensions(request.extensions()).cloned();
        tracing::trace!(attempt, ?outcome, "mock exchange");

        let exchange = async move {
            match outcome {
                MockOutcome::Respond(status, body) => respond(status, body),
                MockOutcome::Fail(error) => Err(error),
                MockOutcome::Hang => std::future::pending().await,
                MockOutcome::Delay(delay, status) => {
                    tokio::time::sleep(delay).await;
                    respond(status, "42")
                }
            }
        };

        Box::pin(async move {
            match reference {
                Some(reference) => reference.cancelable(exchange).await,
                None => exchange.await,
            }
        })
    }

    fn cancel(&self, request: &RequestRef) {
        self.canceled.lock().push(request.id());
        request.cancel();
    }

    fn close_idle_connections(&self) {
        self.idle_closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn respond(status: StatusCode, body: &'static str) -> Result<Response, Error> {
    let mut response = http::Response::new(Body::from(body));
    *response.status_mut() = status;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get() -> Request {
        http::Request::get("http://mock/").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn follows_script() {
        let transport = MockTransport::scripted(|attempt, _| match attempt {
            0 => MockOutcome::Fail(Error::transport("nope")),
            _ => MockOutcome::Respond(StatusCode::ACCEPTED, "ok"),
        });

        assert!(transport.exchange(get()).await.is_err());
        let response = transport.exchange(get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test]
    async fn hang_ends_on_cancel() {
        let transport = MockTransport::hanging();
        let reference = RequestRef::new(9, http::Method::GET, "http://mock/".parse().unwrap());
        let mut request = get();
        request.extensions_mut().insert(reference.clone());

        let attempt = tokio::spawn(transport.exchange(request));
        transport.cancel(&reference);

        let result = attempt.await.unwrap();
        assert!(result.unwrap_err().is_canceled());
        assert_eq!(transport.canceled(), vec![9]);
    }
}

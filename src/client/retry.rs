//! Retrying transient exchange failures.
//!
//! Only failures to complete an exchange are ever retried. A response is a successful
//! attempt whatever its status, including 5xx, and is handed back unmodified.
//!
//! A failed attempt is retried when all of these hold:
//!
//! 1. the request method is allowed by the policy (by default, exactly `GET`),
//! 2. fewer than [`RetryPolicy::max_tries`] retries have been made,
//! 3. the error is transient (see [`RetryPolicy::is_transient`]),
//! 4. the request can be replayed, i.e. its body is buffered in memory.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::stats::{StatsRecord, StatsSink};
use super::transport::Exchange;
use super::{Error, RequestRef};
use crate::body::{Request, Response, TryCloneRequest as _};

/// Error text suffixes which mark a failure as transient.
///
/// Matching is exact and case-sensitive against the message of each error in the chain.
/// Messages vary by platform and library, so this only catches the failures whose text
/// happens to match.
pub const KNOWN_FAILURE_SUFFIXES: [&str; 6] = [
    "connection refused",
    "connection reset by peer.",
    "connection timed out.",
    "no such host.",
    "remote error: handshake failure",
    "unexpected EOF.",
];

/// Longest wait produced by [`Backoff::Exponential`].
const MAX_EXPONENTIAL_WAIT: Duration = Duration::from_secs(60 * 60);

/// How long to wait between a failed attempt and its retry.
///
/// The index passed to [`Backoff::wait`] is the zero-based index of the attempt which
/// just failed.
#[derive(Clone, Default)]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    NoWait,

    /// Wait `index` seconds.
    Linear,

    /// Wait `2^index` seconds, capped at one hour.
    Exponential,

    /// Wait for a caller-provided duration.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Backoff {
    /// Use a custom wait function.
    pub fn custom<F>(wait: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Backoff::Custom(Arc::new(wait))
    }

    /// How long to wait after attempt `index` failed.
    pub fn wait(&self, index: u32) -> Duration {
        match self {
            Backoff::NoWait => Duration::ZERO,
            Backoff::Linear => Duration::from_secs(u64::from(index)),
            Backoff::Exponential => 1u64
                .checked_shl(index)
                .map(Duration::from_secs)
                .unwrap_or(MAX_EXPONENTIAL_WAIT)
                .min(MAX_EXPONENTIAL_WAIT),
            Backoff::Custom(wait) => wait(index),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::NoWait => f.write_str("NoWait"),
            Backoff::Linear => f.write_str("Linear"),
            Backoff::Exponential => f.write_str("Exponential"),
            Backoff::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Decides which requests may be retried.
pub type MethodPredicate = Arc<dyn Fn(&Method) -> bool + Send + Sync>;

/// Policy for retrying failed exchanges.
#[derive(Clone)]
pub struct RetryPolicy {
    max_tries: u32,
    backoff: Backoff,
    methods: Option<MethodPredicate>,
    retry_after_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_tries", &self.max_tries)
            .field("backoff", &self.backoff)
            .field("custom_methods", &self.methods.is_some())
            .field("retry_after_timeout", &self.retry_after_timeout)
            .finish()
    }
}

impl RetryPolicy {
    /// Retry transient failures of `GET` requests up to `max_tries` times, immediately.
    pub fn new(max_tries: u32) -> Self {
        Self {
            max_tries,
            backoff: Backoff::NoWait,
            methods: None,
            retry_after_timeout: false,
        }
    }

    /// Set the maximum number of retries.
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Set the wait between attempts.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the method check, which by default allows only `GET`.
    pub fn with_methods<F>(mut self, allowed: F) -> Self
    where
        F: Fn(&Method) -> bool + Send + Sync + 'static,
    {
        self.methods = Some(Arc::new(allowed));
        self
    }

    /// Also treat the response-header timeout, and any other timeout the underlying
    /// transport reports, as transient.
    pub fn with_retry_after_timeout(mut self, enabled: bool) -> Self {
        self.retry_after_timeout = enabled;
        self
    }

    /// Maximum number of retries. A logical exchange makes at most `max_tries + 1` attempts.
    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// The wait between attempts.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// May requests with this method be retried?
    pub fn allows(&self, method: &Method) -> bool {
        match &self.methods {
            Some(allowed) => allowed(method),
            None => method == Method::GET,
        }
    }

    /// Is this failure worth retrying?
    ///
    /// Walks the error and its sources. A link is transient when it carries a temporary
    /// signal, or (with [`with_retry_after_timeout`](RetryPolicy::with_retry_after_timeout))
    /// a timeout signal, or when its message ends with one of
    /// [`KNOWN_FAILURE_SUFFIXES`]. Deadline cancellation is never transient.
    ///
    /// I/O timeouts (including a dial timeout), interruptions and file descriptor
    /// exhaustion count as temporary. A [`Error::ResponseHeaderTimeout`] is only retried
    /// with `retry_after_timeout`.
    pub fn is_transient(&self, error: &(dyn StdError + 'static)) -> bool {
        let mut next = Some(error);
        while let Some(error) = next {
            if let Some(Error::Canceled) = error.downcast_ref::<Error>() {
                return false;
            }

            if is_temporary(error) || (self.retry_after_timeout && is_timeout(error)) {
                return true;
            }

            let message = error.to_string();
            if KNOWN_FAILURE_SUFFIXES
                .iter()
                .any(|suffix| message.ends_with(suffix))
            {
                return true;
            }

            next = error.source();
        }

        false
    }
}

fn is_temporary(error: &(dyn StdError + 'static)) -> bool {
    if let Some(error) = error.downcast_ref::<Error>() {
        return error.is_temporary();
    }

    if let Some(error) = error.downcast_ref::<io::Error>() {
        return matches!(
            error.kind(),
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ) || is_descriptor_exhaustion(error);
    }

    false
}

/// `EMFILE` or `ENFILE`: the process or system ran out of file descriptors.
#[cfg(unix)]
fn is_descriptor_exhaustion(error: &io::Error) -> bool {
    matches!(error.raw_os_error(), Some(23 | 24))
}

#[cfg(not(unix))]
fn is_descriptor_exhaustion(_error: &io::Error) -> bool {
    false
}

fn is_timeout(error: &(dyn StdError + 'static)) -> bool {
    if let Some(error) = error.downcast_ref::<Error>() {
        return error.is_timeout();
    }

    if let Some(error) = error.downcast_ref::<io::Error>() {
        return error.kind() == io::ErrorKind::TimedOut;
    }

    if let Some(error) = error.downcast_ref::<hyper::Error>() {
        return error.is_timeout();
    }

    false
}

/// A response from the final attempt, and how many retries it took.
#[derive(Debug)]
pub(crate) struct Attempted {
    pub(crate) response: Response,
    pub(crate) retries: u32,
}

/// The error from the final attempt, and how many retries preceded it.
#[derive(Debug)]
pub(crate) struct Failed {
    pub(crate) error: Error,
    pub(crate) retries: u32,
}

/// Drives attempts for one logical exchange.
pub(crate) struct Retry<'a> {
    pub(crate) policy: &'a RetryPolicy,
    pub(crate) transport: &'a dyn Exchange,
    pub(crate) stats: Option<&'a dyn StatsSink>,
    pub(crate) reference: &'a RequestRef,
    pub(crate) start: Instant,
    /// Updated as each retry is announced, so an abandoned exchange can report it.
    pub(crate) progress: &'a AtomicU32,
}

impl Retry<'_> {
    /// Send `request`, retrying transient failures as the policy allows.
    ///
    /// Makes at most `max_tries + 1` attempts.
    pub(crate) async fn attempt(&self, request: Request) -> Result<Attempted, Failed> {
        let mut request = request;
        let mut retries = 0;

        loop {
            // Keep a copy to replay, but only when a retry could actually happen.
            let replay = if retries < self.policy.max_tries && self.policy.allows(request.method())
            {
                request.try_clone_request()
            } else {
                None
            };

            trace!(request.id = self.reference.id(), attempt = retries, "sending attempt");
            let error = match self.transport.exchange(request).await {
                Ok(response) => return Ok(Attempted { response, retries }),
                Err(error) => error,
            };

            let next = match replay {
                Some(next) if self.policy.is_transient(&error) => next,
                _ => return Err(Failed { error, retries }),
            };

            let failed = retries;
            retries += 1;
            self.progress.store(retries, Ordering::Release);
            debug!(
                request.id = self.reference.id(),
                retries,
                %error,
                "retrying request"
            );

            if let Some(stats) = self.stats {
                stats.record(&StatsRecord {
                    request: self.reference,
                    response: None,
                    error: Some(&error),
                    header: self.start.elapsed(),
                    body: Duration::ZERO,
                    retries,
                    retry_pending: true,
                });
            }

            // The deadline keeps running while backing off.
            let wait = self.policy.backoff.wait(failed);
            if !wait.is_zero() {
                trace!(request.id = self.reference.id(), ?wait, "backing off");
                let backoff = self.reference.cancelable(async {
                    tokio::time::sleep(wait).await;
                    Ok::<_, Error>(())
                });
                if let Err(error) = backoff.await {
                    return Err(Failed { error, retries });
                }
            }

            request = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("request failed")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    fn transient(policy: &RetryPolicy, error: Error) -> bool {
        policy.is_transient(&error)
    }

    #[test]
    fn known_suffixes_are_transient() {
        let policy = RetryPolicy::default();
        for suffix in KNOWN_FAILURE_SUFFIXES {
            let error = Error::transport(format!("dial tcp 10.0.0.1:80: {suffix}"));
            assert!(transient(&policy, error), "suffix {suffix:?}");
        }
    }

    #[test]
    fn suffix_match_is_exact() {
        let policy = RetryPolicy::default();
        for message in [
            "",
            "connection refused!",
            "Connection refused",
            "connection reset by peer",
            "connection refused (os error 111)",
        ] {
            assert!(
                !transient(&policy, Error::transport(message)),
                "message {message:?}"
            );
        }
    }

    #[test]
    fn suffix_found_in_source_chain() {
        let policy = RetryPolicy::default();
        let inner = io::Error::new(io::ErrorKind::Other, "read: unexpected EOF.");
        let error = Error::Transport(Box::new(Wrapped(inner)));
        assert!(transient(&policy, error));
    }

    #[test]
    fn temporary_signals() {
        let policy = RetryPolicy::default();
        assert!(transient(&policy, Error::temporary("try again")));
        assert!(transient(
            &policy,
            Error::Transport(Box::new(io::Error::from(io::ErrorKind::Interrupted)))
        ));
        assert!(!transient(
            &policy,
            Error::Transport(Box::new(io::Error::from(io::ErrorKind::PermissionDenied)))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_is_temporary() {
        let policy = RetryPolicy::default();
        for code in [23, 24] {
            let error = Error::Dial(Box::new(io::Error::from_raw_os_error(code)));
            assert!(transient(&policy, error), "os error {code}");
        }
    }

    #[test]
    fn header_timeout_only_with_retry_after_timeout() {
        let strict = RetryPolicy::default();
        let lenient = RetryPolicy::default().with_retry_after_timeout(true);

        assert!(!transient(&strict, Error::ResponseHeaderTimeout));
        assert!(transient(&lenient, Error::ResponseHeaderTimeout));
    }

    #[test]
    fn io_timeouts_are_temporary() {
        let strict = RetryPolicy::default();
        let dial_timeout =
            Error::Dial(Box::new(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")));
        assert!(transient(&strict, dial_timeout));

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        let wrapped = Error::Transport(Box::new(Wrapped(timed_out)));
        assert!(transient(&strict, wrapped));
    }

    #[test]
    fn cancellation_is_never_transient() {
        let lenient = RetryPolicy::default().with_retry_after_timeout(true);
        assert!(!transient(&lenient, Error::Canceled));
    }

    #[test]
    fn only_get_by_default() {
        let policy = RetryPolicy::default();
        assert!(policy.allows(&Method::GET));
        for method in [Method::POST, Method::PUT, Method::HEAD, Method::DELETE] {
            assert!(!policy.allows(&method), "{method}");
        }

        let idempotent = policy.with_methods(|method| method.is_idempotent());
        assert!(idempotent.allows(&Method::PUT));
        assert!(!idempotent.allows(&Method::POST));
    }

    #[test]
    fn backoff_strategies() {
        assert_eq!(Backoff::NoWait.wait(5), Duration::ZERO);
        assert_eq!(Backoff::Linear.wait(0), Duration::ZERO);
        assert_eq!(Backoff::Linear.wait(3), Duration::from_secs(3));
        assert_eq!(Backoff::Exponential.wait(0), Duration::from_secs(1));
        assert_eq!(Backoff::Exponential.wait(3), Duration::from_secs(8));
        assert_eq!(Backoff::Exponential.wait(40), MAX_EXPONENTIAL_WAIT);
        assert_eq!(Backoff::Exponential.wait(200), MAX_EXPONENTIAL_WAIT);

        let custom = Backoff::custom(|index| Duration::from_millis(u64::from(index) * 10));
        assert_eq!(custom.wait(2), Duration::from_millis(20));
    }
}

//! Lifecycle stats for logical exchanges.
//!
//! A configured [`StatsSink`] receives zero or more records with
//! [`retry_pending`](StatsRecord::retry_pending) set (one before each retry), followed by
//! exactly one terminal record per logical exchange.
//!
//! Sinks are called synchronously on whatever task is finishing the exchange, which for a
//! successful exchange is wherever the response body is dropped. They are never given their
//! own thread, so they must not block.

use std::time::Duration;

use http::{HeaderMap, StatusCode, Version};

use super::{Error, RequestRef};

/// The parts of a response worth reporting, captured when the headers arrive.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    /// Response status.
    pub status: StatusCode,

    /// Protocol version the response arrived over.
    pub version: Version,

    /// Response headers.
    pub headers: HeaderMap,
}

impl ResponseInfo {
    pub(crate) fn new<B>(response: &http::Response<B>) -> Self {
        Self {
            status: response.status(),
            version: response.version(),
            headers: response.headers().clone(),
        }
    }
}

/// A snapshot of one lifecycle event, borrowed by the sink for the duration of the call.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct StatsRecord<'a> {
    /// The logical exchange this record belongs to.
    pub request: &'a RequestRef,

    /// The response, when the exchange produced one.
    pub response: Option<&'a ResponseInfo>,

    /// The error which failed the attempt (for retries) or the exchange (when terminal).
    pub error: Option<&'a Error>,

    /// Time from the start of the exchange until the response headers arrived, or until
    /// the failure was observed.
    pub header: Duration,

    /// Time from the arrival of the headers until the body was closed. Zero when no body
    /// was delivered.
    pub body: Duration,

    /// Retries performed so far, including the one about to start when
    /// [`retry_pending`](StatsRecord::retry_pending) is set.
    pub retries: u32,

    /// Set on records emitted just before a retry; clear on the terminal record.
    pub retry_pending: bool,
}

impl StatsRecord<'_> {
    /// Total time covered by this record.
    pub fn elapsed(&self) -> Duration {
        self.header + self.body
    }

    /// Is this the final record for its exchange?
    pub fn is_terminal(&self) -> bool {
        !self.retry_pending
    }
}

/// Receives [`StatsRecord`]s.
///
/// Implemented for any `Fn(&StatsRecord<'_>) + Send + Sync`.
pub trait StatsSink: Send + Sync + 'static {
    /// Observe one lifecycle event.
    fn record(&self, stats: &StatsRecord<'_>);
}

impl<F> StatsSink for F
where
    F: Fn(&StatsRecord<'_>) + Send + Sync + 'static,
{
    fn record(&self, stats: &StatsRecord<'_>) {
        (self)(stats)
    }
}

/// A [`StatsSink`] which logs every record as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceStats;

impl StatsSink for TraceStats {
    fn record(&self, stats: &StatsRecord<'_>) {
        let status = stats.response.map(|response| response.status.as_u16());
        let error = stats.error.map(tracing::field::display);

        if stats.retry_pending {
            tracing::info!(
                request.id = stats.request.id(),
                method = %stats.request.method(),
                uri = %stats.request.uri(),
                retries = stats.retries,
                error,
                "retrying request"
            );
        } else {
            tracing::info!(
                request.id = stats.request.id(),
                method = %stats.request.method(),
                uri = %stats.request.uri(),
                status,
                retries = stats.retries,
                header = ?stats.header,
                body = ?stats.body,
                error,
                "request finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::{Method, Uri};
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: Arc<dyn StatsSink> = {
            let seen = seen.clone();
            Arc::new(move |stats: &StatsRecord<'_>| {
                seen.lock().push((stats.retries, stats.retry_pending));
            })
        };

        let request = RequestRef::new(3, Method::GET, Uri::from_static("http://example.com/"));
        let error = Error::Canceled;
        sink.record(&StatsRecord {
            request: &request,
            response: None,
            error: Some(&error),
            header: Duration::from_millis(5),
            body: Duration::ZERO,
            retries: 1,
            retry_pending: true,
        });

        assert_eq!(&*seen.lock(), &[(1, true)]);
    }

    #[test]
    fn elapsed_sums_phases() {
        let request = RequestRef::new(1, Method::GET, Uri::from_static("http://example.com/"));
        let stats = StatsRecord {
            request: &request,
            response: None,
            error: None,
            header: Duration::from_millis(10),
            body: Duration::from_millis(15),
            retries: 0,
            retry_pending: false,
        };
        assert_eq!(stats.elapsed(), Duration::from_millis(25));
        assert!(stats.is_terminal());
    }
}

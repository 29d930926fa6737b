//! Configuration for a [`Transport`](super::Transport).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::Uri;

use super::monitor::DEFAULT_TICK;
use super::retry::{Backoff, RetryPolicy};
use super::stats::StatsSink;
use super::transport::Exchange;
use super::{Error, Transport};

/// Connection pool settings for the default underlying transport.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Reuse connections between requests. When disabled, no idle connections are kept.
    pub keep_alive: bool,

    /// Maximum number of idle connections kept per host.
    pub max_idle_per_host: usize,

    /// How long an idle connection is kept before it is closed. `None` keeps it
    /// until the server closes it.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            max_idle_per_host: 2,
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

/// Chooses the proxy, if any, for a request URI.
#[derive(Clone)]
pub struct Proxy(Arc<dyn Fn(&Uri) -> Option<Uri> + Send + Sync>);

impl Proxy {
    /// Proxy requests through whatever `resolve` returns for their URI.
    pub fn new<F>(resolve: F) -> Self
    where
        F: Fn(&Uri) -> Option<Uri> + Send + Sync + 'static,
    {
        Self(Arc::new(resolve))
    }

    /// The proxy to use for `uri`, or `None` to connect directly.
    pub fn resolve(&self, uri: &Uri) -> Option<Uri> {
        (self.0)(uri)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Proxy(..)")
    }
}

/// Everything a [`Transport`] needs to know before it starts.
///
/// The configuration is consumed by [`start`](TransportConfig::start), so it cannot
/// change while the transport is running.
#[derive(Clone)]
pub struct TransportConfig {
    pub(crate) dial_timeout: Option<Duration>,
    pub(crate) response_header_timeout: Option<Duration>,
    pub(crate) request_timeout: Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) stats: Option<Arc<dyn StatsSink>>,
    pub(crate) pool: PoolConfig,
    pub(crate) proxy: Option<Proxy>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<Arc<rustls::ClientConfig>>,
    pub(crate) tick: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Some(Duration::from_secs(2)),
            response_header_timeout: Some(Duration::from_secs(3)),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            stats: None,
            pool: PoolConfig::default(),
            proxy: None,
            #[cfg(feature = "tls")]
            tls: None,
            tick: DEFAULT_TICK,
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("TransportConfig");
        debug
            .field("dial_timeout", &self.dial_timeout)
            .field("response_header_timeout", &self.response_header_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .field("stats", &self.stats.is_some())
            .field("pool", &self.pool)
            .field("proxy", &self.proxy);
        #[cfg(feature = "tls")]
        debug.field("tls", &self.tls.is_some());
        debug.field("tick", &self.tick).finish()
    }
}

impl TransportConfig {
    /// Bound connection establishment. `None` waits as long as the OS does.
    pub fn with_dial_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.dial_timeout = timeout.into();
        self
    }

    /// Bound the wait for response headers on each attempt. `None` disables the bound.
    pub fn with_response_header_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.response_header_timeout = timeout.into();
        self
    }

    /// Bound the whole logical exchange, retries and backoff included.
    ///
    /// The deadline is enforced by the monitor, so it fires up to one tick late.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Retry transient failures up to `max_tries` times.
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.retry = self.retry.with_max_tries(max_tries);
        self
    }

    /// Set the wait between retries.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.retry = self.retry.with_backoff(backoff);
        self
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Deliver lifecycle stats to `sink`.
    pub fn with_stats<S: StatsSink>(mut self, sink: S) -> Self {
        self.stats = Some(Arc::new(sink));
        self
    }

    /// Set the connection pool settings.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Route requests through the proxy chosen by `resolve`.
    pub fn with_proxy<F>(mut self, resolve: F) -> Self
    where
        F: Fn(&Uri) -> Option<Uri> + Send + Sync + 'static,
    {
        self.proxy = Some(Proxy::new(resolve));
        self
    }

    /// Use this TLS configuration instead of one built from the native root certificates.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, config: rustls::ClientConfig) -> Self {
        self.tls = Some(Arc::new(config));
        self
    }

    /// How often the monitor looks for expired deadlines.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Connection establishment bound.
    pub fn dial_timeout(&self) -> Option<Duration> {
        self.dial_timeout
    }

    /// Per-attempt response header bound.
    pub fn response_header_timeout(&self) -> Option<Duration> {
        self.response_header_timeout
    }

    /// Total exchange bound.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// The retry policy.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Connection pool settings.
    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// Monitor tick.
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Start a [`Transport`] over the default HTTP transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Result<Transport, Error> {
        Transport::start(self)
    }

    /// Start a [`Transport`] over a custom underlying transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_with<E: Exchange>(self, underlying: E) -> Transport {
        Transport::start_with(self, underlying)
    }
}

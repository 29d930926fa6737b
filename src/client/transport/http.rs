//! The default underlying transport, built on `hyper-util`'s pooled client.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use http::uri::Scheme;
use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tower::util::MapErr;
use tower::{Service as _, ServiceBuilder, ServiceExt as _};
use tracing::trace;

use super::Exchange;
use crate::body::{Body, Request, Response};
use crate::client::config::{PoolConfig, Proxy, TransportConfig};
use crate::client::{Error, RequestRef};
use crate::service::{OptionLayerExt as _, OptionService, Timeout, TimeoutLayer};
use crate::{BoxError, BoxFuture};

type PooledClient = Client<Connector, Body>;
type ClientError = hyper_util::client::legacy::Error;
type Classified = MapErr<PooledClient, fn(ClientError) -> Error>;
type ClientService = OptionService<Timeout<Classified, Error>, Classified>;

/// An [`Exchange`] which sends requests over pooled HTTP/1.1 and HTTP/2 connections.
///
/// Connection establishment is bounded by the configured dial timeout, and the wait for
/// response headers by the response-header timeout. Every attempt also races against
/// cancellation of its [`RequestRef`], so dropping it severs the connection mid-flight.
pub struct HttpTransport {
    connector: Connector,
    pool: PoolConfig,
    response_header_timeout: Option<Duration>,
    service: RwLock<ClientService>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("connector", &self.connector)
            .field("pool", &self.pool)
            .field("response_header_timeout", &self.response_header_timeout)
            .finish()
    }
}

impl HttpTransport {
    /// Build the transport described by `config`.
    pub fn new(config: &TransportConfig) -> Result<Self, Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(config.dial_timeout);

        let connector = Connector {
            http,
            proxy: config.proxy.clone(),
            #[cfg(feature = "tls")]
            tls: super::tls::connector(config.tls.clone())?,
        };

        let service = build(
            connector.clone(),
            &config.pool,
            config.response_header_timeout,
        );

        Ok(Self {
            connector,
            pool: config.pool.clone(),
            response_header_timeout: config.response_header_timeout,
            service: RwLock::new(service),
        })
    }
}

fn build(
    connector: Connector,
    pool: &PoolConfig,
    header_timeout: Option<Duration>,
) -> ClientService {
    let max_idle = if pool.keep_alive {
        pool.max_idle_per_host
    } else {
        0
    };

    let client: PooledClient = Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(pool.idle_timeout)
        .pool_max_idle_per_host(max_idle)
        .build(connector);

    ServiceBuilder::new()
        .optional(header_timeout.map(|timeout| {
            TimeoutLayer::new(|| Error::ResponseHeaderTimeout, timeout)
        }))
        .map_err(Error::from as fn(ClientError) -> Error)
        .service(client)
}

impl Exchange for HttpTransport {
    fn exchange(&self, request: Request) -> BoxFuture<'static, Result<Response, Error>> {
        let service = self.service.read().clone();
        let reference = RequestRef::from_extensions(request.extensions()).cloned();

        let attempt = async move {
            let response = service.oneshot(request).await?;
            Ok(response.map(Body::from))
        };

        Box::pin(async move {
            match reference {
                Some(reference) => reference.cancelable(attempt).await,
                None => attempt.await,
            }
        })
    }

    fn close_idle_connections(&self) {
        // Requests already holding the old pool keep it alive until they finish; the idle
        // connections go with it.
        let fresh = build(
            self.connector.clone(),
            &self.pool,
            self.response_header_timeout,
        );
        *self.service.write() = fresh;
        trace!("replaced connection pool");
    }
}

/// Dials TCP connections for the pool, through a proxy or TLS when required.
#[derive(Clone)]
pub(super) struct Connector {
    http: HttpConnector,
    proxy: Option<Proxy>,
    #[cfg(feature = "tls")]
    tls: tokio_rustls::TlsConnector,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl tower::Service<Uri> for Connector {
    type Response = Conn;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Conn, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        tower::Service::poll_ready(&mut self.http, cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let proxy = self.proxy.as_ref().and_then(|proxy| proxy.resolve(&uri));
        Box::pin(connect(self.clone(), uri, proxy))
    }
}

async fn connect(connector: Connector, uri: Uri, proxy: Option<Uri>) -> Result<Conn, BoxError> {
    let mut http = connector.http;
    let https = uri.scheme() == Some(&Scheme::HTTPS);

    if let Some(proxy) = proxy {
        if https {
            return Err(
                "https through a proxy requires CONNECT tunnelling, which is not supported".into(),
            );
        }

        trace!(%uri, %proxy, "connecting through proxy");
        let io = http.call(proxy).await?;
        return Ok(Conn::plain(io, true));
    }

    let io = http.call(uri.clone()).await?;
    if !https {
        return Ok(Conn::plain(io, false));
    }

    #[cfg(feature = "tls")]
    {
        let stream = super::tls::handshake(&connector.tls, &uri, io.into_inner()).await?;
        return Ok(Conn {
            stream: Stream::Tls(TokioIo::new(stream)),
            proxied: false,
        });
    }

    #[cfg(not(feature = "tls"))]
    {
        drop(io);
        return Err(format!("{uri}: https requires the `tls` feature").into());
    }
}

#[pin_project::pin_project(project = StreamProj)]
enum Stream {
    Plain(#[pin] TokioIo<TcpStream>),

    #[cfg(feature = "tls")]
    Tls(#[pin] TokioIo<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// A connection produced by [`Connector`].
#[pin_project::pin_project]
pub(super) struct Conn {
    #[pin]
    stream: Stream,
    proxied: bool,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.stream {
            Stream::Plain(_) => "plain",
            #[cfg(feature = "tls")]
            Stream::Tls(_) => "tls",
        };
        f.debug_struct("Conn")
            .field("stream", &kind)
            .field("proxied", &self.proxied)
            .finish()
    }
}

impl Conn {
    fn plain(io: TokioIo<TcpStream>, proxied: bool) -> Self {
        Self {
            stream: Stream::Plain(io),
            proxied,
        }
    }
}

impl Connection for Conn {
    fn connected(&self) -> Connected {
        let connected = match &self.stream {
            Stream::Plain(io) => io.inner().connected(),

            #[cfg(feature = "tls")]
            Stream::Tls(io) => {
                let (tcp, session) = io.inner().get_ref();
                if session.alpn_protocol() == Some(b"h2".as_slice()) {
                    tcp.connected().negotiated_h2()
                } else {
                    tcp.connected()
                }
            }
        };

        connected.proxy(self.proxied)
    }
}

macro_rules! delegate {
    ($this:ident, $io:ident => $call:expr) => {
        match $this.project().stream.project() {
            StreamProj::Plain($io) => $call,
            #[cfg(feature = "tls")]
            StreamProj::Tls($io) => $call,
        }
    };
}

impl Read for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self, io => io.poll_read(cx, buf))
    }
}

impl Write for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, io => io.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, io => io.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, io => io.poll_shutdown(cx))
    }

    fn is_write_vectored(&self) -> bool {
        match &self.stream {
            Stream::Plain(io) => io.is_write_vectored(),
            #[cfg(feature = "tls")]
            Stream::Tls(io) => io.is_write_vectored(),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, io => io.poll_write_vectored(cx, bufs))
    }
}

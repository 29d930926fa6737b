//! TLS for the default transport, using rustls.

use std::sync::Arc;

use http::Uri;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::client::Error;
use crate::BoxError;

/// Get a default TLS client configuration by loading the platform's native certificates.
pub fn default_tls_config() -> Result<ClientConfig, Error> {
    let native = rustls_native_certs::load_native_certs();
    if native.certs.is_empty() {
        if let Some(error) = native.errors.into_iter().next() {
            return Err(Error::Tls(error.into()));
        }
    }

    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    trace!(added, ignored, "loaded native root certificates");

    let mut cfg = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    cfg.alpn_protocols.push(b"h2".to_vec());
    cfg.alpn_protocols.push(b"http/1.1".to_vec());
    Ok(cfg)
}

pub(super) fn connector(config: Option<Arc<ClientConfig>>) -> Result<TlsConnector, Error> {
    let config = match config {
        Some(config) => config,
        None => Arc::new(default_tls_config()?),
    };
    Ok(TlsConnector::from(config))
}

pub(super) async fn handshake(
    tls: &TlsConnector,
    uri: &Uri,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>, BoxError> {
    let host = uri.host().ok_or("missing host in uri")?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let domain = ServerName::try_from(host.to_owned())?;

    trace!(%host, "tls handshake");
    let stream = tls.connect(domain, tcp).await?;
    Ok(stream)
}
